//! # Mesh Node
//!
//! The LoRa mesh engine: a [`MeshAdapter`] that owns every piece of protocol
//! state, and the task pipeline that drives it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  RxFrame   ┌──────────────┐  frames   ┌────────────┐
//! │ radio task │ ─────────► │  mesh task   │ ────────► │ RadioGate  │
//! │ (polling)  │  bounded   │ MeshAdapter  │           │ (one lock) │
//! └────────────┘   queue    └──────────────┘           └────────────┘
//!                               ▲       │
//!                      Command  │       │ MeshEvent
//!                               │       ▼
//!                          MeshHandle  MeshEvents
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mesh_node::{spawn, EngineLimits, MeshEvent, NodeSettings, PipelineConfig, SimAir};
//! use mesh_storage::MemoryStore;
//! use mesh_wire::{ProtobufCodec, BROADCAST_ADDR};
//!
//! # async fn run() -> Result<(), mesh_node::NodeError> {
//! let air = SimAir::new();
//! let mut node = spawn(
//!     NodeSettings::default(),
//!     EngineLimits::default(),
//!     PipelineConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Box::new(air.attach()),
//!     Arc::new(ProtobufCodec),
//! )
//! .await?;
//!
//! node.handle.send_text(BROADCAST_ADDR, 0, "hello mesh", false).await?;
//! while let Some(event) = node.events.next().await {
//!     if let MeshEvent::TextReceived { from, text, .. } = event {
//!         println!("{:#010x}: {}", from, text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod radio;
pub mod settings;

pub use adapter::{DropReason, MeshAdapter, NodeStatus, PacketOutcome};
pub use error::NodeError;
pub use events::{EventSink, MeshEvent, MeshEvents};
pub use pipeline::{spawn, Command, MeshHandle, MeshNode};
pub use radio::{Radio, RadioGate, RxFrame, SignalQuality, SimAir, SimRadio};
pub use settings::{ChannelSettings, EngineLimits, NodeSettings, PipelineConfig};
