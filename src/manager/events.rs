//! Messages into and out of the protocol manager

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::common::{Interface, InterfaceId, Node};
use crate::envelope::EnvelopeRef;
use crate::error::{Error, Result};
use crate::protocol::{ProtocolId, ProtocolKind, ProtocolSummary, Stream};

/// Work items processed one at a time by the manager task
pub enum ManagerEvent {
    /// Transmit an envelope to each target node
    SendDataObject {
        envelope: EnvelopeRef,
        targets: Vec<Node>,
    },
    LocalInterfaceUp(Interface),
    LocalInterfaceDown(InterfaceId),
    NeighborInterfaceDown(InterfaceId),
    /// Named configuration parameter
    Config { key: String, value: String },
    GetSenderProtocol {
        kind: ProtocolKind,
        peer: Interface,
        reply: oneshot::Sender<Result<ProtocolId>>,
    },
    GetServerProtocol {
        kind: ProtocolKind,
        local: Interface,
        reply: oneshot::Sender<Result<ProtocolId>>,
    },
    ListProtocols {
        reply: oneshot::Sender<Vec<ProtocolSummary>>,
    },
    /// Stop accepting new peers
    PrepareShutdown,
    Shutdown,

    // Posted by protocol tasks
    /// A server accepted a connection
    Accepted {
        server: ProtocolId,
        kind: ProtocolKind,
        local: Interface,
        stream: Stream,
        peer_addr: SocketAddr,
    },
    /// A protocol task finished on its own
    Exited {
        id: ProtocolId,
        result: Result<()>,
    },

    /// Posted by the shutdown timer
    ShutdownTimeout,
}

impl fmt::Debug for ManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerEvent::SendDataObject { envelope, targets } => {
                write!(f, "SendDataObject({:?}, {} targets)", envelope, targets.len())
            }
            ManagerEvent::LocalInterfaceUp(iface) => write!(f, "LocalInterfaceUp({})", iface),
            ManagerEvent::LocalInterfaceDown(id) => write!(f, "LocalInterfaceDown({})", id),
            ManagerEvent::NeighborInterfaceDown(id) => write!(f, "NeighborInterfaceDown({})", id),
            ManagerEvent::Config { key, value } => write!(f, "Config({}={})", key, value),
            ManagerEvent::GetSenderProtocol { kind, peer, .. } => {
                write!(f, "GetSenderProtocol({}, {})", kind, peer)
            }
            ManagerEvent::GetServerProtocol { kind, local, .. } => {
                write!(f, "GetServerProtocol({}, {})", kind, local)
            }
            ManagerEvent::ListProtocols { .. } => write!(f, "ListProtocols"),
            ManagerEvent::PrepareShutdown => write!(f, "PrepareShutdown"),
            ManagerEvent::Shutdown => write!(f, "Shutdown"),
            ManagerEvent::Accepted { server, peer_addr, .. } => {
                write!(f, "Accepted({} from {})", server, peer_addr)
            }
            ManagerEvent::Exited { id, result } => match result {
                Ok(()) => write!(f, "Exited({})", id),
                Err(e) => write!(f, "Exited({}: {})", id, e),
            },
            ManagerEvent::ShutdownTimeout => write!(f, "ShutdownTimeout"),
        }
    }
}

/// Results reported to the owner of the manager
#[derive(Debug)]
pub enum Notification {
    SendSuccess { envelope: EnvelopeRef, target: Node },
    SendFailure { envelope: EnvelopeRef, target: Node },
    Received { envelope: EnvelopeRef, source: Interface },
    /// A neighbor became reachable through an incoming connection
    InterfaceUp(Interface),
    InterfaceDown(Interface),
    /// Every protocol instance is gone; sent exactly once per shutdown
    ShutdownComplete,
}

impl Notification {
    pub fn is_send_verdict(&self) -> bool {
        matches!(
            self,
            Notification::SendSuccess { .. } | Notification::SendFailure { .. }
        )
    }
}

/// Map a dropped reply channel to an error
pub(crate) fn closed<T>(_: T) -> Error {
    Error::Protocol("protocol manager is not running".into())
}
