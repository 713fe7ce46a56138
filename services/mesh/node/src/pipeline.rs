//! The radio task and the mesh task.
//!
//! The radio task polls the driver and pushes frames into a bounded inbound
//! queue. The mesh task owns the [`MeshAdapter`]; on every tick it drains the
//! inbound queue and runs one send cycle. Everything else reaches the adapter
//! as a [`Command`] through a [`MeshHandle`].

use std::sync::Arc;

use mesh_storage::KeyStore;
use mesh_wire::PayloadCodec;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{MeshAdapter, NodeStatus, PacketOutcome};
use crate::events::MeshEvents;
use crate::radio::{Radio, RadioGate, RxFrame};
use crate::settings::{EngineLimits, NodeSettings, PipelineConfig};
use crate::NodeError;

type Reply<T> = oneshot::Sender<Result<T, NodeError>>;

/// Requests served by the mesh task
#[derive(Debug)]
pub enum Command {
    /// Queue chat text
    SendText {
        /// Destination node or broadcast
        dest: u32,
        /// Channel index
        channel: usize,
        /// Text
        text: String,
        /// Ask for an acknowledgement
        want_ack: bool,
        /// Packet id
        reply: Reply<u32>,
    },
    /// Queue an application payload
    SendAppData {
        /// Destination node or broadcast
        dest: u32,
        /// Channel index
        channel: usize,
        /// Portnum
        portnum: u32,
        /// Payload
        payload: Vec<u8>,
        /// Ask for an acknowledgement
        want_ack: bool,
        /// Packet id
        reply: Reply<u32>,
    },
    /// Begin key verification with a peer
    StartVerification {
        /// Peer
        remote: u32,
        /// Result
        reply: Reply<()>,
    },
    /// Number typed by the operator
    SubmitNumber {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
        /// Number shown on the peer
        number: u32,
        /// Result
        reply: Reply<()>,
    },
    /// Operator is done with the pairing code
    FinishVerification {
        /// Whether a session was running
        reply: Reply<bool>,
    },
    /// Abandon verification
    ResetVerification {
        /// Done
        reply: Reply<()>,
    },
    /// Replace runtime settings
    ApplyConfig {
        /// New settings
        settings: NodeSettings,
        /// Result
        reply: Reply<()>,
    },
    /// Forget one peer key
    ForgetPeer {
        /// Peer
        node_id: u32,
        /// Whether a key was removed
        reply: Reply<bool>,
    },
    /// Forget every peer key
    WipePeers {
        /// Result
        reply: Reply<()>,
    },
    /// Read counters
    Status {
        /// Snapshot
        reply: Reply<NodeStatus>,
    },
    /// Flush state and stop
    Shutdown {
        /// Flush result
        reply: Reply<()>,
    },
}

/// Cloneable front door to a running mesh task
#[derive(Debug, Clone)]
pub struct MeshHandle {
    node_id: u32,
    tx: mpsc::Sender<Command>,
}

impl MeshHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)?
    }

    /// This node's id
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Queue chat text; returns the packet id reported in `SendResult`
    pub async fn send_text(
        &self,
        dest: u32,
        channel: usize,
        text: impl Into<String>,
        want_ack: bool,
    ) -> Result<u32, NodeError> {
        let text = text.into();
        self.request(|reply| Command::SendText {
            dest,
            channel,
            text,
            want_ack,
            reply,
        })
        .await
    }

    /// Queue an application payload
    pub async fn send_app_data(
        &self,
        dest: u32,
        channel: usize,
        portnum: u32,
        payload: Vec<u8>,
        want_ack: bool,
    ) -> Result<u32, NodeError> {
        self.request(|reply| Command::SendAppData {
            dest,
            channel,
            portnum,
            payload,
            want_ack,
            reply,
        })
        .await
    }

    /// Begin key verification with `remote`
    pub async fn start_verification(&self, remote: u32) -> Result<(), NodeError> {
        self.request(|reply| Command::StartVerification { remote, reply })
            .await
    }

    /// Submit the number shown on `remote`
    pub async fn submit_number(&self, remote: u32, nonce: u64, number: u32) -> Result<(), NodeError> {
        self.request(|reply| Command::SubmitNumber {
            remote,
            nonce,
            number,
            reply,
        })
        .await
    }

    /// Close the verification session after the code was shown
    pub async fn finish_verification(&self) -> Result<bool, NodeError> {
        self.request(|reply| Command::FinishVerification { reply })
            .await
    }

    /// Abandon any verification session
    pub async fn reset_verification(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::ResetVerification { reply })
            .await
    }

    /// Replace runtime settings
    pub async fn apply_config(&self, settings: NodeSettings) -> Result<(), NodeError> {
        self.request(|reply| Command::ApplyConfig { settings, reply })
            .await
    }

    /// Forget one peer key
    pub async fn forget_peer(&self, node_id: u32) -> Result<bool, NodeError> {
        self.request(|reply| Command::ForgetPeer { node_id, reply })
            .await
    }

    /// Forget every peer key
    pub async fn wipe_peers(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::WipePeers { reply }).await
    }

    /// Queue sizes and verification state
    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Persist pending state and stop both tasks
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// A started engine
#[derive(Debug)]
pub struct MeshNode {
    /// Command front door
    pub handle: MeshHandle,
    /// Event stream
    pub events: MeshEvents,
    /// Mesh task
    pub mesh_task: JoinHandle<()>,
    /// Radio task
    pub radio_task: JoinHandle<()>,
}

/// Open the adapter and start the radio and mesh tasks
pub async fn spawn(
    settings: NodeSettings,
    limits: EngineLimits,
    config: PipelineConfig,
    store: Arc<dyn KeyStore>,
    radio: Box<dyn Radio>,
    codec: Arc<dyn PayloadCodec>,
) -> Result<MeshNode, NodeError> {
    let gate = RadioGate::new(radio);
    let (sink, events) = MeshEvents::channel();
    let adapter = MeshAdapter::open(settings, limits, store, gate.clone(), codec, sink).await?;
    let node_id = adapter.node_id();

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth.max(1));
    let (command_tx, command_rx) = mpsc::channel(config.command_queue_depth.max(1));

    let radio_task = tokio::spawn(run_radio(gate, inbound_tx, config.clone()));
    let mesh_task = tokio::spawn(run_mesh(adapter, command_rx, inbound_rx, config));

    Ok(MeshNode {
        handle: MeshHandle {
            node_id,
            tx: command_tx,
        },
        events,
        mesh_task,
        radio_task,
    })
}

async fn run_radio(gate: RadioGate, inbound: mpsc::Sender<RxFrame>, config: PipelineConfig) {
    let mut poll = time::interval(config.radio_poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let push_timeout = config.inbound_push_timeout();

    loop {
        tokio::select! {
            _ = inbound.closed() => break,
            _ = poll.tick() => {}
        }

        loop {
            let frame = match gate.receive().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("Radio receive failed: {}", e);
                    break;
                }
            };
            match inbound.send_timeout(frame, push_timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(frame)) => {
                    warn!(
                        "Inbound queue full, dropping {} byte frame",
                        frame.bytes.len()
                    );
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    debug!("Radio task stopping");
                    return;
                }
            }
        }
    }
    debug!("Radio task stopped");
}

async fn run_mesh(
    mut adapter: MeshAdapter,
    mut commands: mpsc::Receiver<Command>,
    mut inbound: mpsc::Receiver<RxFrame>,
    config: PipelineConfig,
) {
    let mut tick = time::interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Mesh task started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    inbound.close();
                    let _ = reply.send(adapter.flush().await);
                    break;
                }
                Some(command) => handle_command(&mut adapter, command).await,
                None => {
                    if let Err(e) = adapter.flush().await {
                        error!("Failed to flush state: {}", e);
                    }
                    break;
                }
            },
            _ = tick.tick() => {
                let now = time::Instant::now().into_std();
                while let Ok(frame) = inbound.try_recv() {
                    let outcome = adapter.handle_raw_packet(&frame, now).await;
                    if let PacketOutcome::Dropped(reason) = outcome {
                        trace!("Frame dropped: {:?}", reason);
                    }
                }
                adapter.process_send_queue(now).await;
            }
        }
    }
    info!("Mesh task stopped");
}

async fn handle_command(adapter: &mut MeshAdapter, command: Command) {
    let now = time::Instant::now().into_std();
    // a dropped reply receiver means the caller gave up
    match command {
        Command::SendText {
            dest,
            channel,
            text,
            want_ack,
            reply,
        } => {
            let _ = reply.send(adapter.send_text(dest, channel, &text, want_ack));
        }
        Command::SendAppData {
            dest,
            channel,
            portnum,
            payload,
            want_ack,
            reply,
        } => {
            let _ = reply.send(adapter.send_app_data(dest, channel, portnum, payload, want_ack));
        }
        Command::StartVerification { remote, reply } => {
            let _ = reply.send(adapter.start_verification(remote, now));
        }
        Command::SubmitNumber {
            remote,
            nonce,
            number,
            reply,
        } => {
            let _ = reply.send(adapter.submit_number(remote, nonce, number, now));
        }
        Command::FinishVerification { reply } => {
            let _ = reply.send(Ok(adapter.finish_verification()));
        }
        Command::ResetVerification { reply } => {
            adapter.reset_verification();
            let _ = reply.send(Ok(()));
        }
        Command::ApplyConfig { settings, reply } => {
            let _ = reply.send(adapter.apply_config(settings));
        }
        Command::ForgetPeer { node_id, reply } => {
            let _ = reply.send(adapter.forget_peer(node_id).await);
        }
        Command::WipePeers { reply } => {
            let _ = reply.send(adapter.wipe_peers().await);
        }
        Command::Status { reply } => {
            let _ = reply.send(Ok(adapter.status()));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(adapter.flush().await);
        }
    }
}
