//! Protocol Manager
//!
//! Owns the registry of protocol instances and runs as a single task that
//! handles one `ManagerEvent` at a time. Responsibilities:
//! - Transport selection and sender reuse for outgoing envelopes
//! - One server per protocol kind, receivers for accepted connections
//! - Reacting to interface up/down events
//! - Coordinated shutdown with a forced detach after a timeout
//!
//! The owner drives it through a cloneable `ManagerHandle` and receives
//! results as `Notification`s.

mod events;
mod registry;
mod select;

pub use events::{ManagerEvent, Notification};
pub use registry::Registry;
pub use select::select_interface;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::common::{Address, Interface, InterfaceId, InterfaceStore, Node};
use crate::config::Config;
use crate::envelope::EnvelopeRef;
use crate::error::{Error, Result};
use crate::metrics::{PROTOCOLS_ACTIVE, PROTOCOLS_FORCED_DETACH};
use crate::protocol::{
    Delivery, Protocol, ProtocolContext, ProtocolId, ProtocolKind, ProtocolSettings,
    ProtocolShared, ProtocolState, ProtocolSummary, Stream, TcpReceiver, TcpSender, TcpServer,
};

use events::closed;
use registry::Removed;

// ============================================================================
// Handle
// ============================================================================

/// Cloneable entry point into a running manager
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl ManagerHandle {
    fn post(&self, event: ManagerEvent) -> Result<()> {
        self.tx.send(event).map_err(closed)
    }

    /// Queue `envelope` for every target. Verdicts arrive as notifications.
    pub fn send_data_object(&self, envelope: EnvelopeRef, targets: Vec<Node>) -> Result<()> {
        self.post(ManagerEvent::SendDataObject { envelope, targets })
    }

    pub fn local_interface_up(&self, iface: Interface) -> Result<()> {
        self.post(ManagerEvent::LocalInterfaceUp(iface))
    }

    pub fn local_interface_down(&self, id: InterfaceId) -> Result<()> {
        self.post(ManagerEvent::LocalInterfaceDown(id))
    }

    pub fn neighbor_interface_down(&self, id: InterfaceId) -> Result<()> {
        self.post(ManagerEvent::NeighborInterfaceDown(id))
    }

    /// Apply a named parameter, e.g. `TCPServer.port`
    pub fn config(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.post(ManagerEvent::Config {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn prepare_shutdown(&self) -> Result<()> {
        self.post(ManagerEvent::PrepareShutdown)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(ManagerEvent::Shutdown)
    }

    /// Reuse or create a sender of `kind` to `peer`
    pub async fn get_sender_protocol(&self, kind: ProtocolKind, peer: Interface) -> Result<ProtocolId> {
        let (reply, rx) = oneshot::channel();
        self.post(ManagerEvent::GetSenderProtocol { kind, peer, reply })?;
        rx.await.map_err(closed)?
    }

    /// Reuse or create the server of `kind`
    pub async fn get_server_protocol(&self, kind: ProtocolKind, local: Interface) -> Result<ProtocolId> {
        let (reply, rx) = oneshot::channel();
        self.post(ManagerEvent::GetServerProtocol { kind, local, reply })?;
        rx.await.map_err(closed)?
    }

    /// Snapshot of every registered instance
    pub async fn protocols(&self) -> Result<Vec<ProtocolSummary>> {
        let (reply, rx) = oneshot::channel();
        self.post(ManagerEvent::ListProtocols { reply })?;
        rx.await.map_err(closed)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Posts `Exited` when a protocol task ends, including when it is aborted
/// or panics
struct ExitGuard {
    id: ProtocolId,
    events: mpsc::UnboundedSender<ManagerEvent>,
    result: Option<Result<()>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(Error::Protocol("task cancelled".into())));
        let _ = self.events.send(ManagerEvent::Exited {
            id: self.id,
            result,
        });
    }
}

pub struct ProtocolManager {
    config: Config,
    settings: ProtocolSettings,
    store: Arc<InterfaceStore>,
    registry: Arc<Registry>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    notify: mpsc::UnboundedSender<Notification>,
    timer: Option<JoinHandle<()>>,
    shutting_down: bool,
    done: bool,
}

impl ProtocolManager {
    pub fn new(
        config: Config,
        store: Arc<InterfaceStore>,
        notify: mpsc::UnboundedSender<Notification>,
    ) -> (Self, ManagerHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ManagerHandle {
            tx: events_tx.clone(),
        };
        let manager = Self {
            settings: ProtocolSettings::from_config(&config),
            config,
            store,
            registry: Arc::new(Registry::new()),
            events_tx,
            events_rx,
            notify,
            timer: None,
            shutting_down: false,
            done: false,
        };
        (manager, handle)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Handle events until shutdown has completed
    pub async fn run(mut self) {
        debug!("Protocol manager started");
        while !self.done {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            trace!("Event: {:?}", event);
            self.handle(event).await;
        }
        debug!("Protocol manager stopped");
    }

    async fn handle(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::SendDataObject { envelope, targets } => {
                self.on_send(envelope, targets).await;
            }
            ManagerEvent::LocalInterfaceUp(iface) => self.on_local_interface_up(iface).await,
            ManagerEvent::LocalInterfaceDown(id) => self.on_local_interface_down(&id),
            ManagerEvent::NeighborInterfaceDown(id) => self.on_neighbor_interface_down(&id),
            ManagerEvent::Config { key, value } => self.on_config(&key, &value),
            ManagerEvent::GetSenderProtocol { kind, peer, reply } => {
                let _ = reply.send(self.get_sender_protocol(kind, peer).await);
            }
            ManagerEvent::GetServerProtocol { kind, local, reply } => {
                let _ = reply.send(self.get_server_protocol(kind, local).await);
            }
            ManagerEvent::ListProtocols { reply } => {
                let _ = reply.send(self.registry.summaries());
            }
            ManagerEvent::PrepareShutdown => self.on_prepare_shutdown(),
            ManagerEvent::Shutdown => self.on_shutdown(),
            ManagerEvent::Accepted {
                server,
                kind,
                local,
                stream,
                peer_addr,
            } => {
                trace!("Connection from {} on server {}", peer_addr, server);
                self.on_accepted(kind, local, stream, Address::Inet(peer_addr))
                    .await;
            }
            ManagerEvent::Exited { id, result } => self.on_exited(id, result),
            ManagerEvent::ShutdownTimeout => self.on_shutdown_timeout(),
        }
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Initialize, register and start a protocol instance
    pub async fn start_protocol(&mut self, proto: Box<dyn Protocol>) -> Result<ProtocolId> {
        self.start_announced(proto, None).await
    }

    /// `announced` is a neighbor the owner was told about when the
    /// instance was created; it is reported down when the instance exits.
    async fn start_announced(
        &mut self,
        mut proto: Box<dyn Protocol>,
        announced: Option<Interface>,
    ) -> Result<ProtocolId> {
        let name = proto.info().name();
        if let Err(e) = proto.init().await {
            warn!("[{}] Initialization failed: {}", name, e);
            return Err(e);
        }

        let shared = ProtocolShared::new(proto.info().clone());
        shared.set_state(ProtocolState::Initialized);
        shared.set_bound(proto.bound_addr());
        if !self.registry.insert(shared.clone(), announced) {
            debug!("[{}] Shutting down, instance discarded", name);
            return Err(Error::Protocol(format!("[{}] registry closed", name)));
        }
        shared.set_state(ProtocolState::Registered);

        let id = shared.id();
        let kind = shared.info().kind;
        let ctx = ProtocolContext::new(
            shared,
            self.events_tx.clone(),
            self.notify.clone(),
            self.settings.clone(),
        );
        let mut guard = ExitGuard {
            id,
            events: self.events_tx.clone(),
            result: None,
        };
        let handle = tokio::spawn(async move {
            guard.result = Some(proto.run(ctx).await);
        });
        self.registry.set_handle(id, handle);
        PROTOCOLS_ACTIVE.with_label_values(&[kind.name()]).inc();
        debug!("[{}] Started", name);
        Ok(id)
    }

    async fn get_sender_protocol(&mut self, kind: ProtocolKind, peer: Interface) -> Result<ProtocolId> {
        if let Some(id) = self.registry.find_sender(kind, &peer.id) {
            trace!("Reusing sender {} to {}", id, peer);
            return Ok(id);
        }
        if self.registry.is_closed() {
            return Err(Error::NoRoute(format!("shutting down, not sending to {}", peer)));
        }

        let local = self
            .store
            .parent_of(&peer.id)
            .ok_or_else(|| Error::NoRoute(format!("no local interface reaches {}", peer)))?;
        let sender = TcpSender::new(kind, local, peer, &self.settings);
        self.start_protocol(Box::new(sender))
            .await
            .map_err(|e| match e {
                Error::NoRoute(_) => e,
                other => Error::NoRoute(other.to_string()),
            })
    }

    async fn get_server_protocol(&mut self, kind: ProtocolKind, local: Interface) -> Result<ProtocolId> {
        if let Some(id) = self.registry.find_server(kind) {
            return Ok(id);
        }
        let server = TcpServer::new(kind, local, &self.settings);
        self.start_protocol(Box::new(server)).await
    }

    /// Drop a finished instance from bookkeeping
    fn retire(&self, removed: Removed, state: ProtocolState) {
        removed.shared.set_state(state);
        removed.shared.queue().close_and_clear();
        PROTOCOLS_ACTIVE
            .with_label_values(&[removed.shared.info().kind.name()])
            .dec();
        if let Some(peer) = removed.announced {
            self.store.remove(&peer.id);
            let _ = self.notify.send(Notification::InterfaceDown(peer));
        }
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    async fn on_send(&mut self, envelope: EnvelopeRef, targets: Vec<Node>) {
        for target in targets {
            let mut delivery = Delivery::new(envelope.clone(), target.clone(), self.notify.clone());

            // A sender may close on idle between lookup and push; retry
            // once with a fresh instance.
            for _ in 0..2 {
                let id = match self.route(&target).await {
                    Ok(id) => id,
                    Err(e) => {
                        debug!("Cannot send [{}] to {}: {}", envelope.id(), target, e);
                        break;
                    }
                };
                match self.registry.enqueue(id, delivery) {
                    Ok(()) => {
                        trace!("Queued [{}] for {} on {}", envelope.id(), target, id);
                        break;
                    }
                    Err(rejected) => delivery = rejected,
                }
            }
            // A delivery still held here was not queued and fails on drop
        }
    }

    async fn route(&mut self, target: &Node) -> Result<ProtocolId> {
        let iface = select_interface(target)?;
        let kind = ProtocolKind::for_peer(&iface)
            .ok_or_else(|| Error::NoRoute(format!("no protocol for {}", iface)))?;
        self.get_sender_protocol(kind, iface).await
    }

    async fn on_local_interface_up(&mut self, iface: Interface) {
        let iface = iface.local().with_up(true);
        if !self.store.set_up(&iface.id, true) {
            self.store.add(iface.clone(), None);
        }

        let Some(kind) = ProtocolKind::for_local(&iface) else {
            info!("No server started on {}", iface);
            return;
        };
        match self.get_server_protocol(kind, iface.clone()).await {
            Ok(id) => debug!("Server {} serves {}", id, iface),
            Err(e) => error!("Could not start {} server on {}: {}", kind, iface, e),
        }
    }

    fn on_local_interface_down(&mut self, id: &InterfaceId) {
        self.store.set_up(id, false);
        let affected = self
            .registry
            .select(|s| s.info().is_for_interface(id) && !s.info().local.is_application());
        debug!("Local interface {} down, stopping {} instances", id, affected.len());
        for shared in affected {
            shared.request_shutdown();
        }
    }

    fn on_neighbor_interface_down(&mut self, id: &InterfaceId) {
        self.store.set_up(id, false);
        let affected = self.registry.select(|s| {
            let info = s.info();
            info.is_client() && !info.local.is_application() && info.is_for_interface(id)
        });
        debug!("Neighbor {} down, stopping {} instances", id, affected.len());
        for shared in affected {
            shared.request_shutdown();
        }
    }

    fn on_config(&mut self, key: &str, value: &str) {
        match self.config.apply_parameter(key, value) {
            Ok(()) => self.settings = ProtocolSettings::from_config(&self.config),
            Err(e) => warn!("Ignoring parameter {}={}: {}", key, value, e),
        }
    }

    async fn on_accepted(&mut self, kind: ProtocolKind, local: Interface, stream: Stream, addr: Address) {
        if self.registry.is_closed() {
            debug!("Shutting down, dropping connection from {}", addr);
            return;
        }

        let (peer, announced) = match self.store.neighbor_by_address(&addr) {
            Some(peer) => (peer, None),
            None => {
                let peer = Interface::new(format!("{}-{}", kind, addr), local.kind).with_address(addr);
                self.store.add(peer.clone(), Some(local.id.clone()));
                (peer.clone(), Some(peer))
            }
        };

        let receiver = TcpReceiver::new(kind, local, peer, stream);
        match self.start_announced(Box::new(receiver), announced.clone()).await {
            Ok(_) => {
                if let Some(peer) = announced {
                    let _ = self.notify.send(Notification::InterfaceUp(peer));
                }
            }
            Err(e) => {
                debug!("Receiver not started: {}", e);
                if let Some(peer) = announced {
                    self.store.remove(&peer.id);
                }
            }
        }
    }

    fn on_exited(&mut self, id: ProtocolId, result: Result<()>) {
        let Some(removed) = self.registry.remove(id) else {
            // Already detached
            trace!("Exit of unknown instance {}", id);
            return;
        };
        let name = removed.shared.info().name();
        match result {
            Ok(()) => debug!("[{}] Done", name),
            Err(e) => debug!("[{}] Done with error: {}", name, e),
        }
        self.retire(removed, ProtocolState::Done);
        self.check_shutdown_complete();
    }

    fn on_prepare_shutdown(&mut self) {
        let servers = self
            .registry
            .select(|s| s.info().is_server() && !s.info().local.is_application());
        info!("Preparing shutdown, stopping {} servers", servers.len());
        for shared in servers {
            shared.request_shutdown();
        }
    }

    fn on_shutdown(&mut self) {
        if self.shutting_down {
            debug!("Shutdown already in progress");
            return;
        }
        self.shutting_down = true;
        self.registry.close();

        let all = self.registry.select(|_| true);
        info!("Shutting down {} protocol instances", all.len());
        for shared in &all {
            shared.request_shutdown();
        }

        if self.registry.is_empty() {
            self.finish_shutdown();
            return;
        }

        let timeout = self.config.protocol.shutdown_timeout();
        let events = self.events_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(ManagerEvent::ShutdownTimeout);
        }));
    }

    fn on_shutdown_timeout(&mut self) {
        if self.done || !self.shutting_down {
            return;
        }
        self.timer = None;

        let stuck = self.registry.drain();
        warn!(
            "{} after {:?}: detaching {} protocol instances",
            Error::Timeout,
            self.config.protocol.shutdown_timeout(),
            stuck.len()
        );
        for mut removed in stuck {
            warn!("[{}] Did not exit, cancelling", removed.shared.info().name());
            if let Some(handle) = removed.handle.take() {
                handle.abort();
            }
            PROTOCOLS_FORCED_DETACH.inc();
            self.retire(removed, ProtocolState::Garbage);
        }
        self.finish_shutdown();
    }

    fn check_shutdown_complete(&mut self) {
        if self.shutting_down && !self.done && self.registry.is_empty() {
            if let Some(timer) = self.timer.take() {
                timer.abort();
            }
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&mut self) {
        self.done = true;
        info!("All protocol instances stopped");
        let _ = self.notify.send(Notification::ShutdownComplete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InterfaceType;
    use crate::envelope::{Attribute, DataState, Envelope};
    use crate::protocol::{Direction, ProtocolInfo, Role};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn lo() -> Interface {
        Interface::new("lo", InterfaceType::WiredLan)
            .with_address("127.0.0.1".parse().unwrap())
            .local()
    }

    fn config(storage: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.path = storage.to_path_buf();
        config.tcp.port = 0;
        config.protocol.shutdown_timeout_ms = 3000;
        config
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("notification timed out")
            .expect("notification channel closed")
    }

    /// Ignores shutdown requests forever
    struct Stuck {
        info: ProtocolInfo,
    }

    #[async_trait]
    impl Protocol for Stuck {
        fn info(&self) -> &ProtocolInfo {
            &self.info
        }

        async fn init(&mut self) -> Result<()> {
            Ok(())
        }

        async fn run(self: Box<Self>, _ctx: ProtocolContext) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Runs until asked to stop
    struct Idle {
        info: ProtocolInfo,
    }

    #[async_trait]
    impl Protocol for Idle {
        fn info(&self) -> &ProtocolInfo {
            &self.info
        }

        async fn init(&mut self) -> Result<()> {
            Ok(())
        }

        async fn run(self: Box<Self>, mut ctx: ProtocolContext) -> Result<()> {
            ctx.shutdown_requested().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interface_down_matches_peer_side() {
        let dir = tempfile::tempdir().unwrap();
        let (ntx, _nrx) = mpsc::unbounded_channel();
        let (mut manager, handle) =
            ProtocolManager::new(config(dir.path()), Arc::new(InterfaceStore::new()), ntx);
        let registry = manager.registry();

        let peer = Interface::new("peer0", InterfaceType::WiredLan)
            .with_address("127.0.0.9".parse().unwrap());
        let bystander = Interface::new("peer1", InterfaceType::WiredLan)
            .with_address("127.0.0.10".parse().unwrap());
        for iface in [peer, bystander] {
            let idle = Idle {
                info: ProtocolInfo::new(ProtocolKind::Tcp, Role::Client, Direction::Both, lo())
                    .with_peer(iface),
            };
            manager.start_protocol(Box::new(idle)).await.unwrap();
        }
        let _task = manager.spawn();
        assert_eq!(registry.len(), 2);

        handle.local_interface_down(InterfaceId::new("peer0")).unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            while registry.len() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let left = handle.protocols().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].info.peer.as_ref().unwrap().id.as_str(), "peer1");
    }

    #[tokio::test]
    async fn test_sender_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let store = Arc::new(InterfaceStore::new());
        store.add(lo(), None);
        let peer = Interface::new("peer", InterfaceType::WiredLan)
            .with_address(format!("127.0.0.1:{}", port).parse().unwrap());
        store.add(peer.clone(), Some(InterfaceId::new("lo")));

        let (ntx, _nrx) = mpsc::unbounded_channel();
        let (manager, handle) = ProtocolManager::new(config(dir.path()), store, ntx);
        let task = manager.spawn();

        let a = handle.get_sender_protocol(ProtocolKind::Tcp, peer.clone()).await.unwrap();
        let b = handle.get_sender_protocol(ProtocolKind::Tcp, peer).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(handle.protocols().await.unwrap().len(), 1);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_without_parent_is_no_route() {
        let dir = tempfile::tempdir().unwrap();
        let (ntx, _nrx) = mpsc::unbounded_channel();
        let (manager, handle) =
            ProtocolManager::new(config(dir.path()), Arc::new(InterfaceStore::new()), ntx);
        let _task = manager.spawn();

        let orphan = Interface::new("orphan", InterfaceType::WiredLan)
            .with_address("10.9.9.9".parse().unwrap());
        let result = handle.get_sender_protocol(ProtocolKind::Tcp, orphan).await;
        assert!(matches!(result, Err(Error::NoRoute(_))));
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (ntx, mut nrx) = mpsc::unbounded_channel();
        let (manager, handle) =
            ProtocolManager::new(config(dir.path()), Arc::new(InterfaceStore::new()), ntx);
        let _task = manager.spawn();

        let bt = Interface::new("bt0", InterfaceType::ShortRangeRadio)
            .with_address("bt:00:11:22:33:44:55".parse().unwrap());
        let envelope = EnvelopeRef::new(Envelope::new());
        handle
            .send_data_object(
                envelope.clone(),
                vec![Node::peer("a", vec![bt]), Node::peer("b", Vec::new())],
            )
            .unwrap();

        for expected in ["a", "b"] {
            match next(&mut nrx).await {
                Notification::SendFailure { envelope: e, target } => {
                    assert!(e.ptr_eq(&envelope));
                    assert_eq!(target.id, expected);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_stuck_instance_is_detached() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.protocol.shutdown_timeout_ms = 100;

        let (ntx, mut nrx) = mpsc::unbounded_channel();
        let (mut manager, handle) =
            ProtocolManager::new(config, Arc::new(InterfaceStore::new()), ntx);
        let registry = manager.registry();
        let stuck = Stuck {
            info: ProtocolInfo::new(ProtocolKind::Tcp, Role::Client, Direction::Both, lo()),
        };
        manager.start_protocol(Box::new(stuck)).await.unwrap();
        let task = manager.spawn();
        assert_eq!(registry.len(), 1);

        handle.shutdown().unwrap();
        handle.shutdown().unwrap();
        assert!(matches!(next(&mut nrx).await, Notification::ShutdownComplete));
        task.await.unwrap();

        assert!(registry.is_empty());
        assert!(nrx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prepare_shutdown_stops_servers() {
        let dir = tempfile::tempdir().unwrap();
        let (ntx, _nrx) = mpsc::unbounded_channel();
        let (manager, handle) =
            ProtocolManager::new(config(dir.path()), Arc::new(InterfaceStore::new()), ntx);
        let registry = manager.registry();
        let _task = manager.spawn();

        handle.local_interface_up(lo()).unwrap();
        let list = handle.protocols().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].info.is_server());
        assert!(list[0].bound.is_some());

        // A second interface of the same kind shares the server
        let eth = Interface::new("eth0", InterfaceType::WiredLan)
            .with_address("127.0.0.2".parse().unwrap());
        handle.local_interface_up(eth).unwrap();
        assert_eq!(handle.protocols().await.unwrap().len(), 1);

        handle.prepare_shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_send_and_receive_through_manager() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let path = src.path().join("photo.jpg");
        std::fs::write(&path, vec![42u8; 50_000]).unwrap();

        let store = Arc::new(InterfaceStore::new());
        let (ntx, mut nrx) = mpsc::unbounded_channel();
        let (manager, handle) = ProtocolManager::new(config(dst.path()), store.clone(), ntx);
        let task = manager.spawn();

        handle.local_interface_up(lo()).unwrap();
        let port = handle.protocols().await.unwrap()[0].bound.unwrap().port();

        let peer = Interface::new("peer", InterfaceType::WiredLan)
            .with_address(format!("127.0.0.1:{}", port).parse().unwrap());
        store.add(peer.clone(), Some(InterfaceId::new("lo")));

        let mut envelope = Envelope::from_file(&path, None).unwrap();
        envelope.add_attribute(Attribute::new("kind", "photo"));
        let envelope = EnvelopeRef::new(envelope);
        handle
            .send_data_object(envelope.clone(), vec![Node::peer("n", vec![peer])])
            .unwrap();

        let mut sent = false;
        let mut received = false;
        while !(sent && received) {
            match next(&mut nrx).await {
                Notification::SendSuccess { envelope: e, .. } => {
                    assert!(e.ptr_eq(&envelope));
                    sent = true;
                }
                Notification::Received { envelope: e, source } => {
                    assert_eq!(e.id(), envelope.id());
                    assert_eq!(e.lock().data_state(), DataState::VerifiedOk);
                    assert_eq!(source.id.as_str(), "peer");
                    received = true;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        handle.shutdown().unwrap();
        loop {
            if let Notification::ShutdownComplete = next(&mut nrx).await {
                break;
            }
        }
        task.await.unwrap();
    }
}
