//! Interface store
//!
//! Records every known interface together with the local interface it was
//! discovered on. All operations take and return owned values so that no
//! caller-side lock can be held across a store call.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::address::Address;
use super::interface::{Interface, InterfaceId, InterfaceType};

struct InterfaceRecord {
    iface: Interface,
    parent: Option<InterfaceId>,
}

/// Known local and neighbor interfaces
#[derive(Default)]
pub struct InterfaceStore {
    records: Mutex<HashMap<InterfaceId, InterfaceRecord>>,
}

impl InterfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an interface. Returns true if it was not known.
    pub fn add(&self, iface: Interface, parent: Option<InterfaceId>) -> bool {
        let mut records = self.records.lock();
        records
            .insert(iface.id.clone(), InterfaceRecord { iface, parent })
            .is_none()
    }

    pub fn remove(&self, id: &InterfaceId) -> Option<Interface> {
        self.records.lock().remove(id).map(|r| r.iface)
    }

    pub fn get(&self, id: &InterfaceId) -> Option<Interface> {
        self.records.lock().get(id).map(|r| r.iface.clone())
    }

    /// Set the up/down state of a known interface
    pub fn set_up(&self, id: &InterfaceId, up: bool) -> bool {
        match self.records.lock().get_mut(id) {
            Some(record) => {
                record.iface.up = up;
                true
            }
            None => false,
        }
    }

    /// The up local interface a peer interface was discovered on
    pub fn parent_of(&self, peer: &InterfaceId) -> Option<Interface> {
        let records = self.records.lock();
        let parent_id = records.get(peer)?.parent.as_ref()?;
        records
            .get(parent_id)
            .map(|r| &r.iface)
            .filter(|iface| iface.is_up())
            .cloned()
    }

    /// Find an interface carrying the given address (host part only for IP)
    pub fn find_by_address(&self, addr: &Address) -> Option<Interface> {
        self.records
            .lock()
            .values()
            .find(|r| r.iface.has_address(addr))
            .map(|r| r.iface.clone())
    }

    /// Like `find_by_address`, skipping this host's own interfaces
    pub fn neighbor_by_address(&self, addr: &Address) -> Option<Interface> {
        self.records
            .lock()
            .values()
            .find(|r| !r.iface.is_local() && r.iface.has_address(addr))
            .map(|r| r.iface.clone())
    }

    /// Up local interfaces of a type
    pub fn local_by_type(&self, kind: InterfaceType) -> Vec<Interface> {
        self.records
            .lock()
            .values()
            .filter(|r| r.iface.kind == kind && r.iface.is_local() && r.iface.is_up())
            .map(|r| r.iface.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
