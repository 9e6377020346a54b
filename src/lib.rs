//! swarmnode library: the runtime of a wireless swarm node.
//!
//! A node serializes access to slow resources (persistent storage, an
//! inference engine) behind bounded request/response queues, and runs a
//! periodic beacon protocol that computes a capability vector by inference
//! and exchanges it with neighboring nodes.
//!
//! Everything here is host-testable with `cargo test`. Platform binaries
//! are thin consumers that supply the filesystem, the radio transport and
//! the node identity:
//! - `src/main.rs`: in-process swarm simulator over a loopback medium.
//! - `firmware-std/`: ESP-IDF firmware over ESP-NOW and a FAT data partition.

pub mod beacon;
pub mod board;
pub mod clock;
pub mod config;
pub mod dense;
pub mod engine;
pub mod error;
pub mod model;
pub mod node;
pub mod packet;
pub mod peers;
pub mod protocol;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod worker;

pub use config::NodeConfig;
pub use error::{ErrorKind, NodeError};
pub use node::{Node, NodeParts};
pub use packet::NodeId;
