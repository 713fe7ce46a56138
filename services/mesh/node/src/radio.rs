//! Radio abstraction and the shared gate every radio access goes through.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::NodeError;

/// Signal quality of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalQuality {
    /// Received signal strength (dBm)
    pub rssi: i16,
    /// Signal to noise ratio (dB)
    pub snr: f32,
}

/// A frame captured by the radio
#[derive(Debug, Clone, PartialEq)]
pub struct RxFrame {
    /// Raw on-air bytes
    pub bytes: Vec<u8>,
    /// Link quality at reception
    pub signal: SignalQuality,
}

impl RxFrame {
    /// Frame with unknown signal quality
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            signal: SignalQuality::default(),
        }
    }
}

/// A half-duplex packet radio
#[async_trait]
pub trait Radio: Send {
    /// Non-blocking poll for one received frame
    async fn receive(&mut self) -> Result<Option<RxFrame>, NodeError>;

    /// Transmit one frame
    async fn transmit(&mut self, frame: &[u8]) -> Result<(), NodeError>;
}

/// The single owner of the radio; clones share it
#[derive(Clone)]
pub struct RadioGate {
    radio: Arc<Mutex<Box<dyn Radio>>>,
}

impl std::fmt::Debug for RadioGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioGate").finish_non_exhaustive()
    }
}

impl RadioGate {
    /// Wrap a radio
    pub fn new(radio: Box<dyn Radio>) -> Self {
        Self {
            radio: Arc::new(Mutex::new(radio)),
        }
    }

    /// Poll for one frame
    pub async fn receive(&self) -> Result<Option<RxFrame>, NodeError> {
        self.radio.lock().await.receive().await
    }

    /// Transmit one frame
    pub async fn transmit(&self, frame: &[u8]) -> Result<(), NodeError> {
        self.radio.lock().await.transmit(frame).await
    }
}

/// In-memory shared air: every frame reaches every other attached radio
#[derive(Clone, Default)]
pub struct SimAir {
    ports: Arc<DashMap<usize, mpsc::UnboundedSender<Vec<u8>>>>,
    next_port: Arc<AtomicUsize>,
}

impl SimAir {
    /// Empty air
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new radio
    pub fn attach(&self) -> SimRadio {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.ports.insert(port, tx);
        SimRadio {
            port,
            air: self.clone(),
            rx,
            jammed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn deliver(&self, from_port: usize, frame: &[u8]) {
        for entry in self.ports.iter() {
            if *entry.key() != from_port {
                let _ = entry.value().send(frame.to_vec());
            }
        }
    }
}

/// Radio attached to a [`SimAir`]
pub struct SimRadio {
    port: usize,
    air: SimAir,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    jammed: Arc<AtomicBool>,
}

impl SimRadio {
    /// Switch that makes every transmit fail while set
    pub fn jam_switch(&self) -> Arc<AtomicBool> {
        self.jammed.clone()
    }
}

impl Drop for SimRadio {
    fn drop(&mut self) {
        self.air.ports.remove(&self.port);
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn receive(&mut self) -> Result<Option<RxFrame>, NodeError> {
        Ok(self.rx.try_recv().ok().map(|bytes| RxFrame {
            bytes,
            signal: SignalQuality {
                rssi: -60,
                snr: 7.5,
            },
        }))
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), NodeError> {
        if self.jammed.load(Ordering::Relaxed) {
            return Err(NodeError::Radio("channel busy".to_string()));
        }
        trace!("Sim port {} transmit {} bytes", self.port, frame.len());
        self.air.deliver(self.port, frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_air_reaches_others_only() {
        let air = SimAir::new();
        let a = RadioGate::new(Box::new(air.attach()));
        let b = RadioGate::new(Box::new(air.attach()));
        let c = RadioGate::new(Box::new(air.attach()));

        a.transmit(b"hello").await.unwrap();
        assert_eq!(b.receive().await.unwrap().unwrap().bytes, b"hello");
        assert_eq!(c.receive().await.unwrap().unwrap().bytes, b"hello");
        assert!(a.receive().await.unwrap().is_none());
        assert!(b.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jammed_transmit_fails() {
        let air = SimAir::new();
        let radio = air.attach();
        let jam = radio.jam_switch();
        let gate = RadioGate::new(Box::new(radio));

        jam.store(true, Ordering::Relaxed);
        assert!(matches!(gate.transmit(b"x").await, Err(NodeError::Radio(_))));
        jam.store(false, Ordering::Relaxed);
        assert!(gate.transmit(b"x").await.is_ok());
    }
}
