//! Transport interface descriptors and target nodes
//!
//! Interfaces and nodes are plain values. Lookups in the interface store or
//! the protocol registry take these values (or their ids) by reference and
//! never hold a lock on the caller's side while doing so.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::address::{Address, AddressFamily};

/// Interface type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    LoopbackLocal,
    ShortRangeRadio,
    WiredLan,
    WirelessLan,
    ApplicationLocal,
    RemovableMedia,
    Undefined,
}

impl Default for InterfaceType {
    fn default() -> Self {
        InterfaceType::Undefined
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceType::LoopbackLocal => "loopback",
            InterfaceType::ShortRangeRadio => "bluetooth",
            InterfaceType::WiredLan => "ethernet",
            InterfaceType::WirelessLan => "wifi",
            InterfaceType::ApplicationLocal => "application",
            InterfaceType::RemovableMedia => "media",
            InterfaceType::Undefined => "undefined",
        };
        write!(f, "{}", s)
    }
}

/// Stable identifier of an interface (MAC string, device name, app port...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterfaceId(String);

impl InterfaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A local or remote network endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default = "default_up")]
    pub up: bool,
    #[serde(default)]
    pub local: bool,
}

fn default_up() -> bool {
    true
}

impl Interface {
    pub fn new(id: impl Into<String>, kind: InterfaceType) -> Self {
        Self {
            id: InterfaceId::new(id),
            kind,
            addresses: Vec::new(),
            up: true,
            local: false,
        }
    }

    /// Builder: add an address
    pub fn with_address(mut self, addr: Address) -> Self {
        self.addresses.push(addr);
        self
    }

    /// Builder: mark as a local interface
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Builder: set up/down state
    pub fn with_up(mut self, up: bool) -> Self {
        self.up = up;
        self
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_application(&self) -> bool {
        self.kind == InterfaceType::ApplicationLocal
    }

    pub fn has_family(&self, family: AddressFamily) -> bool {
        self.addresses.iter().any(|a| a.family() == family)
    }

    pub fn has_ip_address(&self) -> bool {
        self.addresses.iter().any(Address::is_ip)
    }

    /// Preferred IP address: IPv6 when present, otherwise IPv4
    pub fn ip_address(&self) -> Option<&Address> {
        self.addresses
            .iter()
            .find(|a| a.family() == AddressFamily::Ipv6)
            .or_else(|| self.addresses.iter().find(|a| a.family() == AddressFamily::Ipv4))
    }

    pub fn has_address(&self, addr: &Address) -> bool {
        self.addresses.iter().any(|a| a.same_host(addr))
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Interface {}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Node type of a send target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A remote device
    Peer,
    /// An application attached to this daemon
    Application,
}

/// A send target: a node and a snapshot of its interfaces
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub interfaces: Vec<Interface>,
}

impl Node {
    pub fn peer(id: impl Into<String>, interfaces: Vec<Interface>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Peer,
            interfaces,
        }
    }

    pub fn application(id: impl Into<String>, interfaces: Vec<Interface>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Application,
            interfaces,
        }
    }

    pub fn is_application(&self) -> bool {
        self.kind == NodeKind::Application
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
