/// JSON status protocol.
///
/// All messages are newline-delimited JSON (NDJSON), serialized into fixed
/// buffers with `serde-json-core`.
use serde::Serialize;

use crate::packet::NodeIdString;

/// Messages a node reports about itself and its neighbors
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum NodeMessage<'a> {
    /// Node status report
    #[serde(rename = "status")]
    Status {
        node: &'a NodeIdString,
        /// Uptime in seconds
        uptime: u32,
        /// Active peers in the directory
        peers: u16,
        /// Directory capacity
        capacity: u16,
        /// Beacons broadcast
        tx: u32,
        /// Beacon intervals skipped
        skipped: u32,
        /// Peer beacons ingested
        rx: u32,
        /// Frames failing the size guard or decode
        rejected: u32,
        /// Frames dropped by the receive channel
        overflow: u32,
        /// Board identifier
        board: &'static str,
        /// Firmware version
        version: &'static str,
    },
    /// One active directory entry
    #[serde(rename = "peer")]
    Peer {
        id: &'a NodeIdString,
        rssi: i8,
        /// Milliseconds since last beacon
        age: u32,
        /// First capability entry, a cheap fingerprint of the vector
        cap0: f32,
    },
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = heapless::Vec<u8, MAX_MSG_LEN>;

/// Serialize a NodeMessage to JSON bytes and write to the output buffer.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_message(msg: &NodeMessage, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Serialize into a fresh [`MsgBuffer`].
pub fn to_line(msg: &NodeMessage) -> Option<MsgBuffer> {
    let mut buf = [0u8; MAX_MSG_LEN];
    let len = serialize_message(msg, &mut buf)?;
    MsgBuffer::from_slice(&buf[..len]).ok()
}
