//! Peer directory: a fixed-capacity table of neighbors heard through beacons.

use std::sync::{Arc, Mutex};

use crate::packet::{Capabilities, NodeId, CAPABILITY_LEN};

/// One directory slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmPeer {
    pub id: NodeId,
    /// Signal strength of the last beacon, in dBm.
    pub rssi: i8,
    pub capabilities: Capabilities,
    /// Local device time (ms) when the last beacon was ingested.
    pub last_seen: u32,
    pub active: bool,
}

impl SwarmPeer {
    const EMPTY: SwarmPeer = SwarmPeer {
        id: NodeId([0; 6]),
        rssi: 0,
        capabilities: [0.0; CAPABILITY_LEN],
        last_seen: 0,
        active: false,
    };

    /// Milliseconds since this peer was last heard, wrap-safe.
    pub fn age(&self, now: u32) -> u32 {
        now.wrapping_sub(self.last_seen)
    }
}

/// Outcome of [`PeerDirectory::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Existing slot refreshed.
    Updated(usize),
    /// New peer stored in a free slot.
    Inserted(usize),
    /// Directory full; the beacon was dropped.
    Dropped,
}

pub struct PeerDirectory {
    slots: Box<[SwarmPeer]>,
}

/// Directory shared between the ingest and beacon tasks.
pub type SharedDirectory = Arc<Mutex<PeerDirectory>>;

impl PeerDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![SwarmPeer::EMPTY; capacity].into_boxed_slice(),
        }
    }

    pub fn shared(capacity: usize) -> SharedDirectory {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.iter_active().count()
    }

    pub fn get(&self, id: &NodeId) -> Option<&SwarmPeer> {
        self.slots.iter().find(|p| p.active && p.id == *id)
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &SwarmPeer> {
        self.slots.iter().filter(|p| p.active)
    }

    /// Refresh the active slot for `id`, or claim the first inactive slot.
    /// A full directory drops the beacon silently.
    pub fn upsert(
        &mut self,
        id: NodeId,
        rssi: i8,
        capabilities: &Capabilities,
        now: u32,
    ) -> Upsert {
        let (index, outcome) = match self.slots.iter().position(|p| p.active && p.id == id) {
            Some(index) => (index, Upsert::Updated(index)),
            None => match self.slots.iter().position(|p| !p.active) {
                Some(index) => (index, Upsert::Inserted(index)),
                None => return Upsert::Dropped,
            },
        };

        let slot = &mut self.slots[index];
        slot.id = id;
        slot.rssi = rssi;
        slot.capabilities = *capabilities;
        slot.last_seen = now;
        slot.active = true;
        outcome
    }

    /// Mark peers not heard within `max_age` ms inactive. Returns how many
    /// slots were freed.
    pub fn expire(&mut self, now: u32, max_age: u32) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut().filter(|p| p.active) {
            if slot.age(now) > max_age {
                log::info!("peer {} expired after {} ms", slot.id, slot.age(now));
                slot.active = false;
                freed += 1;
            }
        }
        freed
    }

    /// Copy of every active peer.
    pub fn snapshot(&self) -> Vec<SwarmPeer> {
        self.iter_active().cloned().collect()
    }
}
