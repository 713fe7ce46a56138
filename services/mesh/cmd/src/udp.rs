//! Simulated LoRa air over UDP: every transmit goes to each configured peer.

use std::io::ErrorKind;
use std::net::SocketAddr;

use async_trait::async_trait;
use mesh_node::{NodeError, Radio, RxFrame};
use mesh_wire::MAX_FRAME_SIZE;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

pub struct UdpRadio {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    buf: Vec<u8>,
}

impl UdpRadio {
    pub async fn bind(bind: SocketAddr, peers: Vec<SocketAddr>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind).await?;
        debug!(
            "UDP radio on {} with {} peers",
            socket.local_addr()?,
            peers.len()
        );
        Ok(Self {
            socket,
            peers,
            // one spare byte detects oversized datagrams
            buf: vec![0u8; MAX_FRAME_SIZE + 1],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl Radio for UdpRadio {
    async fn receive(&mut self) -> Result<Option<RxFrame>, NodeError> {
        loop {
            match self.socket.try_recv_from(&mut self.buf) {
                Ok((len, from)) if len > MAX_FRAME_SIZE => {
                    warn!("Ignoring oversized datagram from {}", from);
                }
                Ok((len, from)) => {
                    trace!("{} bytes from {}", len, from);
                    return Ok(Some(RxFrame::new(self.buf[..len].to_vec())));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(NodeError::Radio(e.to_string())),
            }
        }
    }

    async fn transmit(&mut self, frame: &[u8]) -> Result<(), NodeError> {
        if self.peers.is_empty() {
            return Err(NodeError::Radio("no peers configured".to_string()));
        }
        let mut delivered = 0usize;
        for peer in &self.peers {
            match self.socket.send_to(frame, peer).await {
                Ok(_) => delivered += 1,
                Err(e) => debug!("Send to {} failed: {}", peer, e),
            }
        }
        if delivered == 0 {
            return Err(NodeError::Radio("no peer reachable".to_string()));
        }
        Ok(())
    }
}
