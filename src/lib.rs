//! Oppnet - transport core of an opportunistic networking daemon
//!
//! # Architecture
//!
//! ```text
//! owner ──ManagerHandle──▶ ProtocolManager ──▶ Registry of protocol instances
//!   ▲                           │                    │
//!   └──────── Notification ─────┴────────────────────┘
//!
//! protocol instance: Envelope ⇄ Retriever / EnvelopeDecoder ⇄ byte stream
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, Interface, Node, InterfaceStore
//! ├── envelope/        # Content envelope: identity, header codec, decoder, retriever
//! ├── protocol/        # Protocol instances: trait, state machine, TCP, send queue, framing
//! └── manager/         # Transport selection, registry, lifecycle, shutdown
//! ```

// Core types
pub mod common;
pub mod error;

// Layers
pub mod envelope;
pub mod protocol;
pub mod manager;

// Supporting modules
pub mod config;
pub mod metrics;

// Re-exports for convenience
pub use common::{Address, Interface, InterfaceId, InterfaceStore, InterfaceType, Node};
pub use config::Config;
pub use envelope::{Envelope, EnvelopeRef};
pub use error::{Error, Result};
pub use manager::{ManagerHandle, Notification, ProtocolManager};
pub use protocol::{Protocol, ProtocolKind};
