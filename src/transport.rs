//! Peer-to-peer broadcast transport seam.
//!
//! A transport's receive path runs in a context that must not block (a radio
//! driver callback on the device). It hands each frame to a [`FrameSink`],
//! which copies it into a fixed-size buffer and `try_send`s it to the ingest
//! task. Frames that do not fit, or arrive while the channel is full, are
//! counted and dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use heapless::Vec;

use crate::error::NodeError;
use crate::packet::NodeId;
use crate::worker::lock_or_recover;

/// Largest frame a transport delivers (ESP-NOW payload limit).
pub const MAX_FRAME_LEN: usize = 250;

pub type FrameBuf = Vec<u8, MAX_FRAME_LEN>;

/// A received frame.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub src: NodeId,
    pub rssi: i8,
    pub data: FrameBuf,
}

/// Producer side of the received-frame channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: Sender<RxFrame>,
    dropped: Arc<AtomicU32>,
}

impl FrameSink {
    pub fn new(capacity: usize) -> (Self, Receiver<RxFrame>) {
        let (tx, rx) = bounded(capacity);
        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU32::new(0)),
        };
        (sink, rx)
    }

    /// Queue a frame without blocking. Returns `false` if it was dropped.
    pub fn offer(&self, src: NodeId, rssi: i8, data: &[u8]) -> bool {
        let Ok(data) = FrameBuf::from_slice(data) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match self.tx.try_send(RxFrame { src, rssi, data }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Frames dropped for overflow or size since creation.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Broadcast medium shared with neighboring nodes.
pub trait PeerTransport: Send + 'static {
    /// Begin delivering received frames to `sink`.
    fn start(&mut self, sink: FrameSink) -> Result<(), NodeError>;

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), NodeError>;

    fn stop(&mut self) {}
}

// ── Loopback medium ──────────────────────────────────────────────────

struct Station {
    id: NodeId,
    rssi: i8,
    sink: Option<FrameSink>,
}

/// In-process broadcast medium: every frame reaches every other attached
/// station. Used by the host simulator and tests.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    stations: Arc<Mutex<std::vec::Vec<Station>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a station. `rssi` is the signal strength other stations
    /// report for its frames.
    pub fn endpoint(&self, id: NodeId, rssi: i8) -> LoopbackTransport {
        lock_or_recover(&self.stations, "loopback").push(Station { id, rssi, sink: None });
        LoopbackTransport {
            hub: self.clone(),
            id,
        }
    }

    /// Deliver `frame` from `src` to every started station except `src`.
    /// Returns the number of stations that accepted it.
    pub fn inject(&self, src: NodeId, frame: &[u8]) -> usize {
        let stations = lock_or_recover(&self.stations, "loopback");
        let rssi = stations
            .iter()
            .find(|s| s.id == src)
            .map_or(-90, |s| s.rssi);
        stations
            .iter()
            .filter(|s| s.id != src)
            .filter_map(|s| s.sink.as_ref())
            .filter(|sink| sink.offer(src, rssi, frame))
            .count()
    }

    fn attach(&self, id: NodeId, sink: Option<FrameSink>) {
        let mut stations = lock_or_recover(&self.stations, "loopback");
        if let Some(station) = stations.iter_mut().find(|s| s.id == id) {
            station.sink = sink;
        }
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    id: NodeId,
}

impl PeerTransport for LoopbackTransport {
    fn start(&mut self, sink: FrameSink) -> Result<(), NodeError> {
        self.hub.attach(self.id, Some(sink));
        Ok(())
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), NodeError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(NodeError::Transport(format!("frame of {} bytes too long", frame.len())));
        }
        self.hub.inject(self.id, frame);
        Ok(())
    }

    fn stop(&mut self) {
        self.hub.attach(self.id, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId([0x02, 0, 0, 0, 0, n])
    }

    #[test]
    fn sink_drops_when_full() {
        let (sink, rx) = FrameSink::new(2);
        assert!(sink.offer(id(1), -40, b"one"));
        assert!(sink.offer(id(1), -40, b"two"));
        assert!(!sink.offer(id(1), -40, b"three"));
        assert_eq!(sink.dropped(), 1);

        assert_eq!(rx.recv().unwrap().data.as_slice(), b"one");
        assert!(sink.offer(id(1), -40, b"four"));
    }

    #[test]
    fn sink_drops_oversize_frames() {
        let (sink, rx) = FrameSink::new(4);
        assert!(!sink.offer(id(1), -40, &[0u8; MAX_FRAME_LEN + 1]));
        assert!(sink.offer(id(1), -40, &[0u8; MAX_FRAME_LEN]));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn loopback_reaches_other_started_stations() {
        let hub = LoopbackHub::new();
        let mut a = hub.endpoint(id(1), -30);
        let mut b = hub.endpoint(id(2), -60);
        let _silent = hub.endpoint(id(3), -70);

        let (sink_a, rx_a) = FrameSink::new(4);
        let (sink_b, rx_b) = FrameSink::new(4);
        a.start(sink_a).unwrap();
        b.start(sink_b).unwrap();

        a.broadcast(b"hello").unwrap();
        let frame = rx_b.try_recv().unwrap();
        assert_eq!(frame.src, id(1));
        assert_eq!(frame.rssi, -30);
        assert_eq!(frame.data.as_slice(), b"hello");
        assert!(rx_a.try_recv().is_err());

        b.stop();
        a.broadcast(b"again").unwrap();
        assert!(rx_b.try_recv().is_err());
    }
}
