//! Protocol Layer
//!
//! Responsibilities:
//! - One live channel per instance, bound to a local and a peer interface
//! - Instance state machine and cooperative shutdown signalling
//! - Moving envelopes over a connected byte stream
//!
//! Every instance runs as its own task. It talks back to the manager only
//! by posting `ManagerEvent`s, and to the owner only through
//! `Notification`s.

mod queue;
mod stream;
mod tcp;

pub use queue::{Delivery, SendQueue};
pub use stream::{link, send_envelope, EnvelopeReader, Link, Stream};
pub use tcp::{TcpReceiver, TcpSender, TcpServer};

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::common::{Interface, InterfaceId, Result};
use crate::config::Config;
use crate::manager::{ManagerEvent, Notification};

// ============================================================================
// Identity and classification
// ============================================================================

/// Transport kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Stream connection to a peer device over IP
    Tcp,
    /// Stream connection to an application on this host
    Local,
}

impl ProtocolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Local => "local",
        }
    }

    /// Kind used to send to a peer interface, if any can reach it
    pub fn for_peer(iface: &Interface) -> Option<Self> {
        if !iface.has_ip_address() {
            return None;
        }
        if iface.is_application() {
            Some(ProtocolKind::Local)
        } else {
            Some(ProtocolKind::Tcp)
        }
    }

    /// Kind of server to run on a local interface, if any
    pub fn for_local(iface: &Interface) -> Option<Self> {
        Self::for_peer(iface)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Listening instance or connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Which way envelopes flow through an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sender,
    Receiver,
    Both,
}

impl Direction {
    pub fn can_send(&self) -> bool {
        matches!(self, Direction::Sender | Direction::Both)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, Direction::Receiver | Direction::Both)
    }
}

/// Instance lifecycle
///
/// ```text
/// Created -> Initialized -> Registered -> [Connecting -> Connected] -> Running
///         -> ShuttingDown -> Done | Garbage
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolState {
    Created,
    Initialized,
    Registered,
    Connecting,
    Connected,
    Running,
    ShuttingDown,
    Garbage,
    Done,
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolState::Garbage | ProtocolState::Done)
    }
}

static NEXT_PROTOCOL_ID: AtomicU64 = AtomicU64::new(1);

/// Registry key of a protocol instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(u64);

impl ProtocolId {
    /// A fresh, never reused id
    pub fn next() -> Self {
        Self(NEXT_PROTOCOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static description of an instance
#[derive(Debug, Clone)]
pub struct ProtocolInfo {
    pub id: ProtocolId,
    pub kind: ProtocolKind,
    pub role: Role,
    pub direction: Direction,
    pub local: Interface,
    pub peer: Option<Interface>,
}

impl ProtocolInfo {
    pub fn new(kind: ProtocolKind, role: Role, direction: Direction, local: Interface) -> Self {
        Self {
            id: ProtocolId::next(),
            kind,
            role,
            direction,
            local,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: Interface) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// Whether `id` is this instance's local or peer interface
    pub fn is_for_interface(&self, id: &InterfaceId) -> bool {
        &self.local.id == id || self.peer.as_ref().map_or(false, |p| &p.id == id)
    }

    /// Short name for log lines, e.g. `tcp-sender#4`
    pub fn name(&self) -> String {
        let what = match (self.role, self.direction) {
            (Role::Server, _) => "server",
            (_, Direction::Sender) => "sender",
            (_, Direction::Receiver) => "receiver",
            (_, Direction::Both) => "client",
        };
        format!("{}-{}{}", self.kind, what, self.id)
    }
}

/// Snapshot of a registered instance
#[derive(Debug, Clone)]
pub struct ProtocolSummary {
    pub info: ProtocolInfo,
    pub state: ProtocolState,
    pub bound: Option<SocketAddr>,
    pub queued: usize,
}

// ============================================================================
// Settings
// ============================================================================

/// Parameters handed to each new instance
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Directory for received payloads
    pub storage: PathBuf,
    pub tcp_port: u16,
    pub local_port: u16,
    pub backlog: u32,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_header_size: usize,
}

impl ProtocolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            storage: config.storage.path.clone(),
            tcp_port: config.tcp.port,
            local_port: config.tcp.local_port,
            backlog: config.tcp.backlog,
            idle_timeout: config.protocol.idle_timeout(),
            connect_timeout: config.protocol.connect_timeout(),
            max_header_size: config.protocol.max_header_size,
        }
    }

    /// Default port for a protocol kind
    pub fn port_for(&self, kind: ProtocolKind) -> u16 {
        match kind {
            ProtocolKind::Tcp => self.tcp_port,
            ProtocolKind::Local => self.local_port,
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared between an instance's task and the registry
pub struct ProtocolShared {
    info: ProtocolInfo,
    state: Mutex<ProtocolState>,
    bound: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    queue: SendQueue,
}

impl ProtocolShared {
    pub fn new(info: ProtocolInfo) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            info,
            state: Mutex::new(ProtocolState::Created),
            bound: Mutex::new(None),
            shutdown,
            queue: SendQueue::new(),
        })
    }

    pub fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    pub fn id(&self) -> ProtocolId {
        self.info.id
    }

    pub fn state(&self) -> ProtocolState {
        *self.state.lock()
    }

    /// Move to `next` unless already terminal
    pub fn set_state(&self, next: ProtocolState) {
        let mut state = self.state.lock();
        if state.is_terminal() || *state == next {
            return;
        }
        debug!("[{}] {:?} -> {:?}", self.info.name(), *state, next);
        *state = next;
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub fn bound(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    pub fn set_bound(&self, addr: Option<SocketAddr>) {
        *self.bound.lock() = addr;
    }

    /// Raise the shutdown flag
    pub fn request_shutdown(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.set_state(ProtocolState::ShuttingDown);
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Usable for another send to the same peer
    pub fn accepts_sends(&self) -> bool {
        self.info.direction.can_send()
            && !self.is_shutting_down()
            && !self.state().is_terminal()
            && !self.queue.is_closed()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn summary(&self) -> ProtocolSummary {
        ProtocolSummary {
            info: self.info.clone(),
            state: self.state(),
            bound: self.bound(),
            queued: self.queue.len(),
        }
    }
}

/// Everything a running instance needs from its surroundings
pub struct ProtocolContext {
    pub shared: Arc<ProtocolShared>,
    pub shutdown: watch::Receiver<bool>,
    pub events: mpsc::UnboundedSender<ManagerEvent>,
    pub notify: mpsc::UnboundedSender<Notification>,
    pub settings: ProtocolSettings,
}

impl ProtocolContext {
    pub fn new(
        shared: Arc<ProtocolShared>,
        events: mpsc::UnboundedSender<ManagerEvent>,
        notify: mpsc::UnboundedSender<Notification>,
        settings: ProtocolSettings,
    ) -> Self {
        let shutdown = shared.subscribe();
        Self {
            shared,
            shutdown,
            events,
            notify,
            settings,
        }
    }

    /// Resolves once shutdown has been requested
    pub async fn shutdown_requested(&mut self) {
        while !*self.shutdown.borrow_and_update() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn set_state(&self, state: ProtocolState) {
        self.shared.set_state(state);
    }

    pub fn name(&self) -> String {
        self.shared.info().name()
    }
}

// ============================================================================
// Capability trait
// ============================================================================

/// A transport-specific protocol instance
///
/// `init` performs resource setup (socket creation, bind). A failed init
/// discards the instance before it is ever registered. `run` is the
/// instance's own loop; it must watch `ProtocolContext::shutdown_requested`
/// at every I/O boundary and return once shutdown is requested.
#[async_trait]
pub trait Protocol: Send {
    fn info(&self) -> &ProtocolInfo;

    async fn init(&mut self) -> Result<()>;

    /// Address the instance is bound to, once initialized
    fn bound_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn run(self: Box<Self>, ctx: ProtocolContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InterfaceType;

    fn peer(kind: InterfaceType, addr: &str) -> Interface {
        Interface::new("p", kind).with_address(addr.parse().unwrap())
    }

    #[test]
    fn test_kind_for_peer() {
        assert_eq!(
            ProtocolKind::for_peer(&peer(InterfaceType::WiredLan, "10.0.0.1")),
            Some(ProtocolKind::Tcp)
        );
        assert_eq!(
            ProtocolKind::for_peer(&peer(InterfaceType::ApplicationLocal, "127.0.0.1:8787")),
            Some(ProtocolKind::Local)
        );
        assert_eq!(
            ProtocolKind::for_peer(&peer(InterfaceType::ShortRangeRadio, "bt:00:11:22:33:44:55")),
            None
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ProtocolId::next();
        let b = ProtocolId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let local = Interface::new("eth0", InterfaceType::WiredLan).local();
        let shared = ProtocolShared::new(ProtocolInfo::new(
            ProtocolKind::Tcp,
            Role::Client,
            Direction::Sender,
            local,
        ));
        assert!(shared.accepts_sends());

        shared.set_state(ProtocolState::Running);
        shared.request_shutdown();
        assert_eq!(shared.state(), ProtocolState::ShuttingDown);
        assert!(!shared.accepts_sends());

        shared.set_state(ProtocolState::Done);
        shared.set_state(ProtocolState::Running);
        assert_eq!(shared.state(), ProtocolState::Done);
    }

    #[tokio::test]
    async fn test_shutdown_requested_resolves() {
        let local = Interface::new("eth0", InterfaceType::WiredLan).local();
        let shared = ProtocolShared::new(ProtocolInfo::new(
            ProtocolKind::Tcp,
            Role::Server,
            Direction::Receiver,
            local,
        ));
        let (events, _erx) = mpsc::unbounded_channel();
        let (notify, _nrx) = mpsc::unbounded_channel();
        let mut ctx = ProtocolContext::new(shared.clone(), events, notify, ProtocolSettings::default());

        let waiter = tokio::spawn(async move {
            ctx.shutdown_requested().await;
        });
        shared.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
