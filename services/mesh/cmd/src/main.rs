//! LoRa mesh node binary.
//!
//! Runs one mesh node over a simulated UDP radio and drives it from the
//! terminal: plain lines are broadcast, `/` commands do the rest.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mesh_node::{MeshEvents, MeshHandle, NodeError};
use mesh_storage::open_store;
use mesh_wire::{node_id_string, ProtobufCodec, BROADCAST_ADDR};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

mod config;
mod console;
mod logging;
mod udp;

use config::{parse_hex, parse_node_id, MeshConfig};
use console::{describe, parse_line, ConsoleCommand, HELP};
use udp::UdpRadio;

/// LoRa mesh node over a simulated UDP radio
#[derive(Parser, Debug)]
#[command(name = "lora-mesh", version, about = "LoRa mesh node with channel and peer security")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Node id (!aabbccdd, 0x.. or decimal); derived from the key when unset
    #[arg(long)]
    node_id: Option<String>,

    /// Long name announced to the mesh
    #[arg(long)]
    long_name: Option<String>,

    /// Short name announced to the mesh
    #[arg(long)]
    short_name: Option<String>,

    /// Primary channel name
    #[arg(long)]
    channel: Option<String>,

    /// Primary channel key as hex
    #[arg(long)]
    psk: Option<String>,

    /// UDP bind address of the simulated radio
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Peer radio address (repeatable)
    #[arg(long)]
    peer: Vec<SocketAddr>,

    /// Storage mode: memory, file
    #[arg(long)]
    storage_mode: Option<String>,

    /// Data directory for file storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Acknowledgement timeout, e.g. 60s
    #[arg(long)]
    ack_timeout: Option<humantime::Duration>,

    /// Identity broadcast interval, e.g. 15m
    #[arg(long)]
    identity_interval: Option<humantime::Duration>,

    /// Mesh task tick, e.g. 50ms
    #[arg(long)]
    tick_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flags win over file and environment
    fn apply(&self, config: &mut MeshConfig) -> anyhow::Result<()> {
        if let Some(node_id) = &self.node_id {
            config.node.node_id = parse_node_id(node_id)?;
        }
        if let Some(name) = &self.long_name {
            config.node.long_name = name.clone();
        }
        if let Some(name) = &self.short_name {
            config.node.short_name = name.clone();
        }
        if let Some(channel) = &self.channel {
            config.node.primary.name = channel.clone();
        }
        if let Some(psk) = &self.psk {
            config.node.primary.psk = parse_hex(psk)?;
        }
        if let Some(bind) = self.bind {
            config.radio.bind = bind;
        }
        if !self.peer.is_empty() {
            config.radio.peers = self.peer.clone();
        }
        if let Some(mode) = &self.storage_mode {
            config.storage.mode = mode.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = dir.clone();
        }
        if let Some(timeout) = self.ack_timeout {
            config.limits.ack_timeout_secs = Duration::from(timeout).as_secs();
        }
        if let Some(interval) = self.identity_interval {
            config.limits.identity_interval_secs = Duration::from(interval).as_secs();
        }
        if let Some(tick) = self.tick_interval {
            config.pipeline.tick_interval_ms = Duration::from(tick).as_millis() as u64;
        }
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level, "mesh")?;

    info!("Starting LoRa mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = MeshConfig::load_from_file(&args.config)?;
    args.apply(&mut config)?;
    config.node.validate()?;

    let store = open_store(config.storage.storage_mode()?).await?;
    let radio = UdpRadio::bind(config.radio.bind, config.radio.peers.clone()).await?;
    component_info!(
        "radio",
        "Simulated radio on {} with peers {:?}",
        radio.local_addr()?,
        config.radio.peers
    );

    let node = mesh_node::spawn(
        config.node.clone(),
        config.limits.clone(),
        config.pipeline.clone(),
        store,
        Box::new(radio),
        Arc::new(ProtobufCodec),
    )
    .await?;
    info!("Node {} ready; /help for commands", node_id_string(node.handle.node_id()));

    run_console(&node.handle, node.events).await?;

    info!("Mesh node shutting down");
    match node.handle.shutdown().await {
        Ok(()) | Err(NodeError::Stopped) => {}
        Err(e) => component_error!("storage", "Failed to flush state: {}", e),
    }
    let _ = node.mesh_task.await;
    let _ = node.radio_task.await;
    info!("Mesh node shutdown complete");
    Ok(())
}

async fn run_console(handle: &MeshHandle, mut events: MeshEvents) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
                return Ok(());
            }
            event = events.next() => match event {
                Some(event) => println!("{}", describe(&event)),
                None => {
                    component_warn!("node", "Mesh task stopped");
                    return Ok(());
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                match parse_line(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => return Ok(()),
                    Ok(Some(command)) => {
                        if let Err(e) = execute(handle, command).await {
                            println!("error: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
        }
    }
}

async fn execute(handle: &MeshHandle, command: ConsoleCommand) -> Result<(), NodeError> {
    match command {
        ConsoleCommand::Broadcast(text) => {
            let msg_id = handle.send_text(BROADCAST_ADDR, 0, text, false).await?;
            component_debug!("console", "Queued broadcast #{}", msg_id);
        }
        ConsoleCommand::Direct { dest, text } => {
            let msg_id = handle.send_text(dest, 0, text, true).await?;
            println!("queued #{} for {}", msg_id, node_id_string(dest));
        }
        ConsoleCommand::Verify(remote) => {
            handle.start_verification(remote).await?;
            println!("verification with {} started", node_id_string(remote));
        }
        ConsoleCommand::Number {
            remote,
            nonce,
            number,
        } => handle.submit_number(remote, nonce, number).await?,
        ConsoleCommand::Done => {
            if !handle.finish_verification().await? {
                println!("no verification running");
            }
        }
        ConsoleCommand::Status => {
            let status = handle.status().await?;
            println!(
                "{}: {} queued, {} awaiting ack, {} known peers, verification {:?}",
                node_id_string(status.node_id),
                status.queued,
                status.awaiting_ack,
                status.known_peers,
                status.verification
            );
        }
        ConsoleCommand::Forget(node_id) => {
            let removed = handle.forget_peer(node_id).await?;
            println!(
                "{} {}",
                node_id_string(node_id),
                if removed { "forgotten" } else { "was not known" }
            );
        }
        ConsoleCommand::Wipe => handle.wipe_peers().await?,
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "lora-mesh",
            "--node-id",
            "!0000a11c",
            "--peer",
            "127.0.0.1:7001",
            "--ack-timeout",
            "90s",
            "--tick-interval",
            "20ms",
        ]);
        let mut config = MeshConfig::default();
        config.radio.peers = vec!["127.0.0.1:9999".parse().unwrap()];
        args.apply(&mut config).unwrap();

        assert_eq!(config.node.node_id, 0xA11C);
        assert_eq!(config.radio.peers, vec!["127.0.0.1:7001".parse().unwrap()]);
        assert_eq!(config.limits.ack_timeout_secs, 90);
        assert_eq!(config.pipeline.tick_interval_ms, 20);
        assert_eq!(config.limits.max_retries, 3);
    }
}
