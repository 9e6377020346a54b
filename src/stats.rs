//! Node counters, updated lock-free by the node's tasks.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct NodeStats {
    pub beacons_sent: AtomicU32,
    /// Intervals skipped because no capability vector was available.
    pub beacon_failures: AtomicU32,
    pub beacons_received: AtomicU32,
    /// Received frames that failed the size guard or decode.
    pub frames_rejected: AtomicU32,
    /// Beacons from new peers dropped because the directory was full.
    pub peers_dropped: AtomicU32,
}

/// Point-in-time copy of [`NodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub beacons_sent: u32,
    pub beacon_failures: u32,
    pub beacons_received: u32,
    pub frames_rejected: u32,
    pub peers_dropped: u32,
}

impl NodeStats {
    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            beacons_sent: self.beacons_sent.load(Ordering::Relaxed),
            beacon_failures: self.beacon_failures.load(Ordering::Relaxed),
            beacons_received: self.beacons_received.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            peers_dropped: self.peers_dropped.load(Ordering::Relaxed),
        }
    }
}
