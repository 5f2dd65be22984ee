//! TCP protocol instances
//!
//! - `TcpServer` listens on a local interface and hands every accepted
//!   connection to the manager
//! - `TcpSender` connects to one peer and drains its queue, closing the
//!   connection after an idle period
//! - `TcpReceiver` decodes envelopes from an accepted connection
//!
//! The `Local` kind uses the same instances on the application endpoint.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use super::stream::{is_envelope_error, link, send_envelope, EnvelopeReader, Stream};
use super::{
    Direction, Protocol, ProtocolContext, ProtocolInfo, ProtocolKind, ProtocolSettings,
    ProtocolState, Role,
};
use crate::common::{Interface, Result};
use crate::envelope::EnvelopeRef;
use crate::error::Error;
use crate::manager::{ManagerEvent, Notification};
use crate::metrics::{format_bytes, BYTES_RECEIVED, BYTES_SENT, DECODE_FAILURES, ENVELOPES_RECEIVED};

// ============================================================================
// Server
// ============================================================================

/// Listening instance
pub struct TcpServer {
    info: ProtocolInfo,
    addr: SocketAddr,
    backlog: u32,
    listener: Option<TcpListener>,
}

impl TcpServer {
    /// Server on `local`. The TCP kind listens on every address of the
    /// interface's family; the local kind only on the interface address.
    pub fn new(kind: ProtocolKind, local: Interface, settings: &ProtocolSettings) -> Self {
        let port = settings.port_for(kind);
        let ip = local.ip_address().and_then(|a| a.as_socket()).map(|s| s.ip());
        let addr = match (kind, ip) {
            (ProtocolKind::Local, Some(ip)) => SocketAddr::new(ip, port),
            (_, Some(IpAddr::V6(_))) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port),
            _ => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        };
        Self::bind_to(kind, local, addr, settings.backlog)
    }

    /// Server on an explicit socket address
    pub fn bind_to(kind: ProtocolKind, local: Interface, addr: SocketAddr, backlog: u32) -> Self {
        Self {
            info: ProtocolInfo::new(kind, Role::Server, Direction::Receiver, local),
            addr,
            backlog,
            listener: None,
        }
    }
}

#[async_trait]
impl Protocol for TcpServer {
    fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    async fn init(&mut self) -> Result<()> {
        let socket = if self.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(self.addr)?;
        self.listener = Some(socket.listen(self.backlog)?);
        Ok(())
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn run(self: Box<Self>, mut ctx: ProtocolContext) -> Result<()> {
        let name = ctx.name();
        let listener = self
            .listener
            .ok_or_else(|| Error::Protocol(format!("[{}] not initialized", name)))?;
        let info = self.info;

        ctx.set_state(ProtocolState::Running);
        info!(
            "[{}] Listening on {} (backlog {})",
            name,
            listener.local_addr()?,
            self.backlog
        );

        let mut accepted: u64 = 0;
        loop {
            tokio::select! {
                _ = ctx.shutdown_requested() => {
                    info!("[{}] Shutting down (accepted {} connections)", name, accepted);
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            accepted += 1;
                            debug!("[{}] Connection #{} from {}", name, accepted, peer_addr);
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!("[{}] set_nodelay failed: {}", name, e);
                            }
                            let event = ManagerEvent::Accepted {
                                server: info.id,
                                kind: info.kind,
                                local: info.local.clone(),
                                stream: link(stream),
                                peer_addr,
                            };
                            if ctx.events.send(event).is_err() {
                                warn!("[{}] Manager gone, stopping", name);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("[{}] Accept error: {}", name, e);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Outgoing connection to one peer interface
pub struct TcpSender {
    info: ProtocolInfo,
    target: Option<SocketAddr>,
}

impl TcpSender {
    pub fn new(
        kind: ProtocolKind,
        local: Interface,
        peer: Interface,
        settings: &ProtocolSettings,
    ) -> Self {
        let addr = peer.ip_address();
        let target = match kind {
            ProtocolKind::Tcp => addr.and_then(|a| a.to_socket(settings.port_for(kind))),
            // The default local port is the daemon's own application server
            ProtocolKind::Local => addr.and_then(|a| a.as_socket()).filter(|a| a.port() != 0),
        };
        Self {
            info: ProtocolInfo::new(kind, Role::Client, Direction::Sender, local).with_peer(peer),
            target,
        }
    }

    /// Deliver the next queued envelope without waiting. Returns false
    /// when the queue is empty.
    async fn drain_one(&self, ctx: &ProtocolContext, stream: &mut Stream) -> Result<bool> {
        let Some(delivery) = ctx.shared.queue().try_pop() else {
            return Ok(false);
        };
        self.deliver(ctx, stream, delivery).await?;
        Ok(true)
    }

    /// Send one envelope and report its verdict
    ///
    /// Returns `Err` when the connection itself broke; per-envelope errors
    /// only fail that delivery.
    async fn deliver(
        &self,
        ctx: &ProtocolContext,
        stream: &mut Stream,
        delivery: super::Delivery,
    ) -> Result<()> {
        let for_application = self.info.kind == ProtocolKind::Local;
        let envelope: EnvelopeRef = delivery.envelope().clone();

        match send_envelope(stream, &envelope, for_application).await {
            Ok(n) => {
                debug!(
                    "[{}] Sent envelope [{}] to {} ({})",
                    ctx.name(),
                    envelope.id(),
                    delivery.target(),
                    format_bytes(n)
                );
                BYTES_SENT.with_label_values(&[self.info.kind.name()]).inc_by(n);
                delivery.succeed();
                Ok(())
            }
            Err(e) if is_envelope_error(&e) => {
                warn!("[{}] Dropping envelope [{}]: {}", ctx.name(), envelope.id(), e);
                delivery.fail();
                Ok(())
            }
            Err(e) => {
                delivery.fail();
                Err(e)
            }
        }
    }

    async fn connect(&self, ctx: &mut ProtocolContext) -> Result<Option<Stream>> {
        let target = self.target.ok_or_else(|| {
            Error::ConnectFailed(format!("[{}] peer has no IP address", ctx.name()))
        })?;
        let timeout = ctx.settings.connect_timeout;

        ctx.set_state(ProtocolState::Connecting);
        debug!("[{}] Connecting to {}", ctx.name(), target);

        let stream = tokio::select! {
            _ = ctx.shutdown_requested() => return Ok(None),
            result = tokio::time::timeout(timeout, TcpStream::connect(target)) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(Error::ConnectFailed(format!("{}: {}", target, e)));
                }
                Err(_) => {
                    return Err(Error::ConnectFailed(format!("{}: timed out", target)));
                }
            },
        };
        stream.set_nodelay(true)?;
        ctx.set_state(ProtocolState::Connected);
        info!("[{}] Connected to {}", ctx.name(), target);
        Ok(Some(link(stream)))
    }

    async fn serve(&self, ctx: &mut ProtocolContext, stream: &mut Stream) -> Result<()> {
        let shared = Arc::clone(&ctx.shared);
        let idle = ctx.settings.idle_timeout;

        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown_requested() => return Ok(()),
                delivery = shared.queue().pop() => match delivery {
                    Some(delivery) => self.deliver(ctx, stream, delivery).await?,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep(idle) => {
                    debug!("[{}] Idle for {:?}, closing", ctx.name(), idle);
                    shared.queue().close();
                    // Late pushes that raced with the timeout still go out
                    while self.drain_one(ctx, stream).await? {}
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Protocol for TcpSender {
    fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    async fn init(&mut self) -> Result<()> {
        if self.target.is_none() {
            return Err(Error::NoRoute(format!(
                "peer {} has no usable IP address",
                self.info.peer.as_ref().map(|p| p.to_string()).unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn run(self: Box<Self>, mut ctx: ProtocolContext) -> Result<()> {
        let mut stream = match self.connect(&mut ctx).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                ctx.shared.queue().close_and_clear();
                return Ok(());
            }
            Err(e) => {
                let failed = ctx.shared.queue().close_and_clear();
                warn!("[{}] {} ({} queued envelopes failed)", ctx.name(), e, failed);
                return Err(e);
            }
        };
        ctx.set_state(ProtocolState::Running);

        let result = self.serve(&mut ctx, &mut stream).await;
        let failed = ctx.shared.queue().close_and_clear();
        if failed > 0 {
            debug!("[{}] {} queued envelopes failed", ctx.name(), failed);
        }
        if let Err(e) = stream.shutdown().await {
            debug!("[{}] Shutdown of connection failed: {}", ctx.name(), e);
        }
        result
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Incoming connection from one peer
pub struct TcpReceiver {
    info: ProtocolInfo,
    stream: Option<Stream>,
}

impl TcpReceiver {
    pub fn new(kind: ProtocolKind, local: Interface, peer: Interface, stream: Stream) -> Self {
        Self {
            info: ProtocolInfo::new(kind, Role::Client, Direction::Receiver, local).with_peer(peer),
            stream: Some(stream),
        }
    }
}

#[async_trait]
impl Protocol for TcpReceiver {
    fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    async fn init(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    async fn run(self: Box<Self>, mut ctx: ProtocolContext) -> Result<()> {
        let name = ctx.name();
        let mut stream = self.stream.ok_or(Error::ConnectionClosed)?;
        let local = self.info.local.clone();
        let source = self.info.peer.clone().unwrap_or_else(|| local.clone());
        let kind = self.info.kind;
        let mut reader = EnvelopeReader::new(
            ctx.settings.storage.clone(),
            ctx.settings.max_header_size,
        );

        ctx.set_state(ProtocolState::Running);
        let mut received: u64 = 0;

        let result = loop {
            let next = tokio::select! {
                _ = ctx.shutdown_requested() => break Ok(()),
                next = reader.next(&mut stream) => next,
            };

            match next {
                Ok(Some(mut envelope)) => {
                    received += 1;
                    envelope.set_receive_interfaces(local.clone(), source.clone());
                    let state = envelope.verify_data();
                    debug!(
                        "[{}] Received envelope [{}] from {} ({:?}, {:?})",
                        name,
                        envelope.id(),
                        source,
                        state,
                        envelope.reception().map(|r| r.transfer_time).unwrap_or_default()
                    );
                    ENVELOPES_RECEIVED.inc();
                    let notification = Notification::Received {
                        envelope: EnvelopeRef::new(envelope),
                        source: source.clone(),
                    };
                    if ctx.notify.send(notification).is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    debug!("[{}] Peer {} closed the connection", name, source);
                    break Ok(());
                }
                Err(e) if is_envelope_error(&e) => {
                    DECODE_FAILURES.inc();
                    warn!("[{}] Discarding envelope from {}: {}", name, source, e);
                }
                Err(e) => break Err(e),
            }
        };

        BYTES_RECEIVED
            .with_label_values(&[kind.name()])
            .inc_by(reader.bytes_read());
        debug!(
            "[{}] Done after {} envelopes ({})",
            name,
            received,
            format_bytes(reader.bytes_read())
        );
        result
    }
}
