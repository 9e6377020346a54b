/// Beacon wire frame.
///
/// Packed little-endian, 138 bytes:
///
/// ```text
/// sender_id [u8; 6] | capabilities [f32; 32] | timestamp u32
/// ```
///
/// Frames of any other length are rejected before decoding.
use core::fmt;

use crate::error::NodeError;

/// Length of a node identity (a 6-byte hardware address).
pub const NODE_ID_LEN: usize = 6;

/// Number of f32 entries in a capability vector.
pub const CAPABILITY_LEN: usize = 32;

/// Bytes of a capability vector as produced by the beacon model.
pub const CAPABILITY_BYTES: usize = CAPABILITY_LEN * 4;

pub const BEACON_FRAME_LEN: usize = NODE_ID_LEN + CAPABILITY_BYTES + 4;

/// Maximum length for node id strings ("AA:BB:CC:DD:EE:FF")
pub type NodeIdString = heapless::String<18>;

pub type Capabilities = [f32; CAPABILITY_LEN];

/// 6-byte node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Format as colon-separated uppercase hex.
    pub fn to_heapless(&self) -> NodeIdString {
        use core::fmt::Write;
        let mut buf = NodeIdString::new();
        let _ = write!(buf, "{}", self);
        buf
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            id[0], id[1], id[2], id[3], id[4], id[5]
        )
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeaconPacket {
    pub sender: NodeId,
    pub capabilities: Capabilities,
    /// Sender's device time in milliseconds.
    pub timestamp: u32,
}

impl BeaconPacket {
    pub fn encode(&self) -> [u8; BEACON_FRAME_LEN] {
        let mut frame = [0u8; BEACON_FRAME_LEN];
        frame[..NODE_ID_LEN].copy_from_slice(&self.sender.0);
        for (chunk, value) in frame[NODE_ID_LEN..NODE_ID_LEN + CAPABILITY_BYTES]
            .chunks_exact_mut(4)
            .zip(self.capabilities.iter())
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        frame[NODE_ID_LEN + CAPABILITY_BYTES..].copy_from_slice(&self.timestamp.to_le_bytes());
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, NodeError> {
        if frame.len() != BEACON_FRAME_LEN {
            return Err(NodeError::FrameSize {
                expected: BEACON_FRAME_LEN,
                actual: frame.len(),
            });
        }

        let mut sender = [0u8; NODE_ID_LEN];
        sender.copy_from_slice(&frame[..NODE_ID_LEN]);

        let capabilities =
            capabilities_from_bytes(&frame[NODE_ID_LEN..NODE_ID_LEN + CAPABILITY_BYTES])?;

        let ts = &frame[NODE_ID_LEN + CAPABILITY_BYTES..];
        let timestamp = u32::from_le_bytes([ts[0], ts[1], ts[2], ts[3]]);

        Ok(Self {
            sender: NodeId(sender),
            capabilities,
            timestamp,
        })
    }
}

/// Decode a model output tensor into a capability vector.
pub fn capabilities_from_bytes(bytes: &[u8]) -> Result<Capabilities, NodeError> {
    if bytes.len() != CAPABILITY_BYTES {
        return Err(NodeError::OutputSizeMismatch {
            expected: CAPABILITY_BYTES,
            actual: bytes.len(),
        });
    }
    let mut caps = [0f32; CAPABILITY_LEN];
    for (value, chunk) in caps.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BeaconPacket {
        let mut capabilities = [0f32; CAPABILITY_LEN];
        for (i, c) in capabilities.iter_mut().enumerate() {
            *c = i as f32 * 0.25 - 1.0;
        }
        BeaconPacket {
            sender: NodeId([0x24, 0x6F, 0x28, 0x01, 0x02, 0x03]),
            capabilities,
            timestamp: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn frame_is_138_bytes() {
        assert_eq!(BEACON_FRAME_LEN, 138);
        assert_eq!(sample().encode().len(), 138);
    }

    #[test]
    fn layout_is_packed_little_endian() {
        let frame = sample().encode();
        assert_eq!(&frame[..6], &[0x24, 0x6F, 0x28, 0x01, 0x02, 0x03]);
        assert_eq!(&frame[6..10], &(-1.0f32).to_le_bytes());
        assert_eq!(&frame[134..], &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn decode_recovers_encoded_packet() {
        let packet = sample();
        assert_eq!(BeaconPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn wrong_length_frames_are_rejected() {
        let frame = sample().encode();
        for len in [0, 1, 137] {
            assert_eq!(
                BeaconPacket::decode(&frame[..len]),
                Err(NodeError::FrameSize {
                    expected: 138,
                    actual: len
                })
            );
        }
        let mut long = frame.to_vec();
        long.push(0);
        assert!(BeaconPacket::decode(&long).is_err());
    }

    #[test]
    fn capability_bytes_must_be_exact() {
        assert!(capabilities_from_bytes(&[0u8; 128]).is_ok());
        assert_eq!(
            capabilities_from_bytes(&[0u8; 64]),
            Err(NodeError::OutputSizeMismatch {
                expected: 128,
                actual: 64
            })
        );
    }

    #[test]
    fn node_id_formats_as_mac() {
        let id = NodeId([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(id.to_string(), "AA:BB:CC:01:02:03");
        assert_eq!(id.to_heapless().as_str(), "AA:BB:CC:01:02:03");
    }
}
