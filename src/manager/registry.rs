//! Registry of live protocol instances
//!
//! The only state touched both from the manager task and from teardown.
//! One mutex guards the map; it is never held while calling out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::common::{Interface, InterfaceId};
use crate::protocol::{Delivery, ProtocolId, ProtocolKind, ProtocolShared, ProtocolSummary};

struct Entry {
    shared: Arc<ProtocolShared>,
    handle: Option<JoinHandle<()>>,
    /// Neighbor announced to the owner when this instance was accepted
    announced: Option<Interface>,
}

/// A registry entry taken out of the map
pub struct Removed {
    pub shared: Arc<ProtocolShared>,
    pub handle: Option<JoinHandle<()>>,
    pub announced: Option<Interface>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ProtocolId, Entry>,
    closed: bool,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance. Rejected once the registry is closed for shutdown.
    pub fn insert(&self, shared: Arc<ProtocolShared>, announced: Option<Interface>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.entries.insert(
            shared.id(),
            Entry {
                shared,
                handle: None,
                announced,
            },
        );
        true
    }

    pub fn set_handle(&self, id: ProtocolId, handle: JoinHandle<()>) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.handle = Some(handle);
        }
    }

    pub fn remove(&self, id: ProtocolId) -> Option<Removed> {
        self.inner.lock().entries.remove(&id).map(|e| Removed {
            shared: e.shared,
            handle: e.handle,
            announced: e.announced,
        })
    }

    /// Take every entry out, e.g. for a forced detach
    pub fn drain(&self) -> Vec<Removed> {
        self.inner
            .lock()
            .entries
            .drain()
            .map(|(_, e)| Removed {
                shared: e.shared,
                handle: e.handle,
                announced: e.announced,
            })
            .collect()
    }

    pub fn get(&self, id: ProtocolId) -> Option<Arc<ProtocolShared>> {
        self.inner.lock().entries.get(&id).map(|e| e.shared.clone())
    }

    /// A reusable sender of `kind` bound to `peer`
    pub fn find_sender(&self, kind: ProtocolKind, peer: &InterfaceId) -> Option<ProtocolId> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| &e.shared)
            .filter(|s| s.info().kind == kind && s.accepts_sends())
            .find(|s| s.info().peer.as_ref().map_or(false, |p| &p.id == peer))
            .map(|s| s.id())
    }

    /// The running server of `kind`, if any
    pub fn find_server(&self, kind: ProtocolKind) -> Option<ProtocolId> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| &e.shared)
            .find(|s| {
                s.info().kind == kind && s.info().is_server() && !s.state().is_terminal()
            })
            .map(|s| s.id())
    }

    /// Instances matching a predicate
    pub fn select<F>(&self, pred: F) -> Vec<Arc<ProtocolShared>>
    where
        F: Fn(&ProtocolShared) -> bool,
    {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| pred(&e.shared))
            .map(|e| e.shared.clone())
            .collect()
    }

    /// Queue a delivery on an instance. Hands the delivery back if the
    /// instance is gone or no longer takes sends.
    pub fn enqueue(&self, id: ProtocolId, delivery: Delivery) -> Result<(), Delivery> {
        match self.get(id) {
            Some(shared) if shared.accepts_sends() => shared.queue().push(delivery),
            _ => Err(delivery),
        }
    }

    /// Stop accepting registrations
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn summaries(&self) -> Vec<ProtocolSummary> {
        let mut list: Vec<ProtocolSummary> = self
            .inner
            .lock()
            .entries
            .values()
            .map(|e| e.shared.summary())
            .collect();
        list.sort_by_key(|s| s.info.id);
        list
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
