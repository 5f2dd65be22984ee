//! Common types and abstractions
//!
//! This module defines the core types used throughout the daemon:
//! - Address / Interface / Node: endpoint descriptors
//! - InterfaceStore: known interfaces and their parents
//! - Error: unified error types

mod address;
mod interface;
mod store;

pub use address::{Address, AddressFamily};
pub use interface::{Interface, InterfaceId, InterfaceType, Node, NodeKind};
pub use store::InterfaceStore;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
