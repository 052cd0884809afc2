//! The resource table: slots per path hash and the payload reverse index.
//!
//! Everything here runs under the factory's table lock. No type callback is
//! ever invoked from this module.

use std::sync::Arc;
use std::thread::ThreadId;

use kiln_core::alloc::HashMap;

use crate::descriptor::{Payload, ResourceDescriptor, payload_key};
use crate::path::PathHash;
use crate::state::{Flight, ResourceState};

/// A live descriptor plus bookkeeping the type never sees.
pub(crate) struct Entry {
    pub(crate) desc: ResourceDescriptor,
    /// Payloads superseded by a recreate that old holders may still release.
    pub(crate) retired: Vec<Payload>,
    /// Set while a recreate is running.
    pub(crate) busy: Option<Arc<Flight>>,
}

pub(crate) enum Slot {
    Loading(Arc<Flight>),
    Ready(Entry),
    Destroying(Arc<Flight>),
}

impl Slot {
    pub(crate) fn state(&self) -> ResourceState {
        match self {
            Slot::Loading(flight) => flight.phase(),
            Slot::Ready(entry) if entry.busy.is_some() => ResourceState::Reloading,
            Slot::Ready(_) => ResourceState::Ready,
            Slot::Destroying(_) => ResourceState::Destroying,
        }
    }

    /// The flight a caller would have to wait on, if any.
    fn pending_flight(&self) -> Option<&Arc<Flight>> {
        match self {
            Slot::Loading(flight) | Slot::Destroying(flight) => Some(flight),
            Slot::Ready(entry) => entry.busy.as_ref(),
        }
    }
}

pub(crate) struct ResourceTable {
    slots: HashMap<PathHash, Slot>,
    by_payload: HashMap<usize, PathHash>,
    /// Which path each blocked thread is waiting on.
    waits_for: HashMap<ThreadId, PathHash>,
    max_resources: usize,
}

impl ResourceTable {
    pub(crate) fn new(max_resources: usize) -> Self {
        Self {
            slots: HashMap::new(),
            by_payload: HashMap::new(),
            waits_for: HashMap::new(),
            max_resources,
        }
    }

    pub(crate) fn max_resources(&self) -> usize {
        self.max_resources
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots.len() >= self.max_resources
    }

    pub(crate) fn slot(&self, hash: PathHash) -> Option<&Slot> {
        self.slots.get(&hash)
    }

    pub(crate) fn slot_mut(&mut self, hash: PathHash) -> Option<&mut Slot> {
        self.slots.get_mut(&hash)
    }

    pub(crate) fn ready(&self, hash: PathHash) -> Option<&Entry> {
        match self.slots.get(&hash) {
            Some(Slot::Ready(entry)) => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn ready_mut(&mut self, hash: PathHash) -> Option<&mut Entry> {
        match self.slots.get_mut(&hash) {
            Some(Slot::Ready(entry)) => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn insert_loading(&mut self, hash: PathHash, flight: Arc<Flight>) {
        self.slots.insert(hash, Slot::Loading(flight));
    }

    /// Turn a loading slot into a live entry with `ref_count` references.
    ///
    /// Fails, returning the descriptor, if its payload already belongs to
    /// another path.
    pub(crate) fn insert_ready(
        &mut self,
        mut desc: ResourceDescriptor,
        ref_count: u32,
    ) -> Result<Payload, ResourceDescriptor> {
        let hash = desc.name_hash();
        let Some(payload) = desc.resource().cloned() else {
            return Err(desc);
        };
        let key = payload_key(&payload);
        if self.by_payload.get(&key).is_some_and(|owner| *owner != hash) {
            return Err(desc);
        }

        desc.set_ref_count(ref_count);
        self.by_payload.insert(key, hash);
        self.slots.insert(
            hash,
            Slot::Ready(Entry {
                desc,
                retired: Vec::new(),
                busy: None,
            }),
        );
        Ok(payload)
    }

    /// Swap a live entry for a destroying slot and drop its payload mappings.
    pub(crate) fn begin_destroy(&mut self, hash: PathHash, flight: Arc<Flight>) -> Option<ResourceDescriptor> {
        if !matches!(self.slots.get(&hash), Some(Slot::Ready(_))) {
            return None;
        }
        match self.slots.insert(hash, Slot::Destroying(flight)) {
            Some(Slot::Ready(entry)) => {
                self.unmap_payloads(&entry);
                Some(entry.desc)
            }
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, hash: PathHash) -> Option<Slot> {
        let slot = self.slots.remove(&hash)?;
        if let Slot::Ready(entry) = &slot {
            self.unmap_payloads(entry);
        }
        Some(slot)
    }

    /// Drain every live entry, used at teardown.
    pub(crate) fn drain_ready(&mut self) -> Vec<ResourceDescriptor> {
        self.by_payload.clear();
        self.slots
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(entry) => Some(entry.desc),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn owner_of(&self, key: usize) -> Option<PathHash> {
        self.by_payload.get(&key).copied()
    }

    pub(crate) fn map_payload(&mut self, payload: &Payload, hash: PathHash) {
        self.by_payload.insert(payload_key(payload), hash);
    }

    /// Forget retired payloads no holder references any more.
    pub(crate) fn sweep_retired(&mut self, hash: PathHash) {
        let Some(Slot::Ready(entry)) = self.slots.get_mut(&hash) else {
            return;
        };
        let by_payload = &mut self.by_payload;
        entry.retired.retain(|payload| {
            let held = Arc::strong_count(payload) > 1;
            if !held {
                by_payload.remove(&payload_key(payload));
            }
            held
        });
    }

    fn unmap_payloads(&mut self, entry: &Entry) {
        if let Some(payload) = entry.desc.resource() {
            self.by_payload.remove(&payload_key(payload));
        }
        for payload in &entry.retired {
            self.by_payload.remove(&payload_key(payload));
        }
    }

    /// Returns `true` if the current thread waiting on `flight` would close a
    /// wait cycle.
    pub(crate) fn would_deadlock(&self, me: ThreadId, flight: &Flight) -> bool {
        let mut owner = flight.owner();
        for _ in 0..=self.waits_for.len() {
            if owner == me {
                return true;
            }
            let Some(next) = self
                .waits_for
                .get(&owner)
                .and_then(|hash| self.slots.get(hash))
                .and_then(Slot::pending_flight)
            else {
                return false;
            };
            owner = next.owner();
        }
        false
    }

    pub(crate) fn begin_wait(&mut self, me: ThreadId, hash: PathHash) {
        self.waits_for.insert(me, hash);
    }

    pub(crate) fn end_wait(&mut self, me: ThreadId) {
        self.waits_for.remove(&me);
    }

    /// Canonical paths of every live entry.
    pub(crate) fn live_paths(&self) -> Vec<(PathHash, Arc<str>)> {
        self.slots
            .iter()
            .filter_map(|(hash, slot)| match slot {
                Slot::Ready(entry) => Some((*hash, entry.desc.shared_path())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::dummy_handle;

    fn descriptor(path: &str, payload: Payload) -> ResourceDescriptor {
        let mut desc = ResourceDescriptor::new(PathHash::of(path), Arc::from(path), dummy_handle("txt"));
        desc.set_resource(payload);
        desc
    }

    #[test]
    fn test_insert_ready_maps_payload() {
        let mut table = ResourceTable::new(4);
        let hash = PathHash::of("/a.txt");
        table.insert_loading(hash, Flight::new(ResourceState::Creating));
        assert_eq!(table.slot(hash).map(Slot::state), Some(ResourceState::Creating));

        let payload = table.insert_ready(descriptor("/a.txt", Arc::new(1u8)), 2).ok().unwrap();
        assert_eq!(table.owner_of(payload_key(&payload)), Some(hash));
        assert_eq!(table.ready(hash).map(|e| e.desc.ref_count()), Some(2));
        assert_eq!(table.slot(hash).map(Slot::state), Some(ResourceState::Ready));
    }

    #[test]
    fn test_payload_cannot_belong_to_two_paths() {
        let mut table = ResourceTable::new(4);
        let shared: Payload = Arc::new(1u8);
        assert!(table.insert_ready(descriptor("/a.txt", shared.clone()), 1).is_ok());
        assert!(table.insert_ready(descriptor("/b.txt", shared), 1).is_err());
    }

    #[test]
    fn test_capacity() {
        let mut table = ResourceTable::new(1);
        assert!(!table.is_full());
        table.insert_loading(PathHash::of("/a.txt"), Flight::new(ResourceState::Preloading));
        assert!(table.is_full());
        assert_eq!(table.max_resources(), 1);
    }

    #[test]
    fn test_destroy_unmaps_retired() {
        let mut table = ResourceTable::new(4);
        let hash = PathHash::of("/a.txt");
        let payload = table.insert_ready(descriptor("/a.txt", Arc::new(1u8)), 1).ok().unwrap();

        let old: Payload = Arc::new(0u8);
        table.map_payload(&old, hash);
        table.ready_mut(hash).unwrap().retired.push(old.clone());

        let desc = table.begin_destroy(hash, Flight::new(ResourceState::Destroying)).unwrap();
        assert_eq!(desc.name_hash(), hash);
        assert_eq!(table.owner_of(payload_key(&payload)), None);
        assert_eq!(table.owner_of(payload_key(&old)), None);
        assert_eq!(table.slot(hash).map(Slot::state), Some(ResourceState::Destroying));
    }

    #[test]
    fn test_sweep_retired_drops_unheld() {
        let mut table = ResourceTable::new(4);
        let hash = PathHash::of("/a.txt");
        table.insert_ready(descriptor("/a.txt", Arc::new(1u8)), 1).ok().unwrap();

        let old: Payload = Arc::new(0u8);
        let key = payload_key(&old);
        table.map_payload(&old, hash);
        table.ready_mut(hash).unwrap().retired.push(old.clone());

        table.sweep_retired(hash);
        assert_eq!(table.owner_of(key), Some(hash));

        drop(old);
        table.sweep_retired(hash);
        assert_eq!(table.owner_of(key), None);
        assert!(table.ready(hash).unwrap().retired.is_empty());
    }

    #[test]
    fn test_wait_cycle_detection() {
        let mut table = ResourceTable::new(4);
        let me = std::thread::current().id();
        let hash = PathHash::of("/a.txt");
        let flight = Flight::new(ResourceState::Creating);
        table.insert_loading(hash, flight.clone());

        // Waiting on a flight we own is always a cycle.
        assert!(table.would_deadlock(me, &flight));

        let other = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        assert!(!table.would_deadlock(other, &flight));
        table.end_wait(other);
        table.begin_wait(me, hash);
        table.end_wait(me);
    }
}
