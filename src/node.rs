//! Node bootstrap: wires storage, the model runtime, the transport and the
//! peer directory together and runs the node's tasks.
//!
//! Threads started per node:
//!
//! | thread    | role                                          |
//! |-----------|-----------------------------------------------|
//! | `storage` | storage worker                                |
//! | `model`   | model worker                                  |
//! | `beacon`  | periodic RUN + broadcast, peer expiry         |
//! | `peer-rx` | drains received frames into the directory     |
//! | `monitor` | periodic NDJSON status lines (optional)       |

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::beacon::{BeaconTask, InputSource, PeerListener};
use crate::board;
use crate::clock::Uptime;
use crate::config::NodeConfig;
use crate::engine::EngineBuilder;
use crate::error::NodeError;
use crate::model::ModelRuntime;
use crate::packet::NodeId;
use crate::peers::{PeerDirectory, SharedDirectory, SwarmPeer};
use crate::protocol::{self, MsgBuffer, NodeMessage, VERSION};
use crate::stats::{NodeStats, StatsSnapshot};
use crate::storage::{Filesystem, StorageManager};
use crate::transport::{FrameSink, PeerTransport};
use crate::worker::lock_or_recover;

/// State shared by a node's tasks.
#[derive(Clone)]
pub struct NodeContext {
    pub identity: NodeId,
    pub directory: SharedDirectory,
    pub stats: Arc<NodeStats>,
    pub uptime: Uptime,
}

impl NodeContext {
    pub fn new(identity: NodeId, max_peers: usize) -> Self {
        Self {
            identity,
            directory: PeerDirectory::shared(max_peers),
            stats: Arc::new(NodeStats::default()),
            uptime: Uptime::start(),
        }
    }
}

/// Platform collaborators a node is built from.
pub struct NodeParts<F, E> {
    /// 6-byte hardware address (Wi-Fi STA MAC on the device).
    pub identity: NodeId,
    pub filesystem: F,
    pub engine: E,
    pub transport: Box<dyn PeerTransport>,
    /// Beacon model input, sampled every interval.
    pub input: Box<dyn InputSource>,
}

pub struct Node<F: Filesystem> {
    config: NodeConfig,
    ctx: NodeContext,
    storage: StorageManager<F>,
    sink: FrameSink,
    shutdown: Option<Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<F: Filesystem> Node<F> {
    /// Validate `config`, start both workers and the transport, then spawn
    /// the node's tasks.
    pub fn start<E: EngineBuilder>(
        config: NodeConfig,
        parts: NodeParts<F, E>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let NodeParts {
            identity,
            filesystem,
            engine,
            mut transport,
            input,
        } = parts;
        log::info!("node {} starting ({}, v{})", identity, board::BOARD_NAME, VERSION);

        let ctx = NodeContext::new(identity, config.max_peers);
        let storage = StorageManager::start(
            filesystem,
            config.storage_queue_capacity,
            config.task_stack_size,
        )?;
        let runtime = ModelRuntime::start(
            engine,
            storage.models(&config.model_dir),
            config.model_settings(),
        )?;

        let (sink, frames) = FrameSink::new(config.rx_queue_capacity);
        transport.start(sink.clone())?;

        // Never sent on: dropping the sender is the shutdown signal.
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        // From here on, an early return drops the node, which stops and
        // joins whatever was already spawned.
        let mut node = Node {
            config,
            ctx,
            storage,
            sink,
            shutdown: Some(shutdown_tx),
            tasks: Vec::new(),
        };

        let listener = PeerListener::new(node.ctx.clone());
        let rx_shutdown = shutdown_rx.clone();
        node.spawn("peer-rx", move || listener.run(frames, rx_shutdown))?;

        let beacon = BeaconTask::new(
            node.ctx.clone(),
            runtime,
            transport,
            input,
            node.config.beacon_settings(),
        );
        let beacon_shutdown = shutdown_rx.clone();
        node.spawn("beacon", move || beacon.run(beacon_shutdown))?;

        if let Some(interval) = node.config.status_interval() {
            let ctx = node.ctx.clone();
            let sink = node.sink.clone();
            node.spawn("monitor", move || run_monitor(ctx, sink, interval, shutdown_rx))?;
        }

        log::info!("node {} started", identity);
        Ok(node)
    }

    pub fn identity(&self) -> NodeId {
        self.ctx.identity
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageManager<F> {
        &self.storage
    }

    pub fn directory(&self) -> SharedDirectory {
        self.ctx.directory.clone()
    }

    /// Active peers right now.
    pub fn peers(&self) -> Vec<SwarmPeer> {
        lock_or_recover(&self.ctx.directory, "peers").snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Received frames dropped by the receive channel.
    pub fn frames_dropped(&self) -> u32 {
        self.sink.dropped()
    }

    /// Current status and peer lines.
    pub fn status_report(&self) -> Vec<MsgBuffer> {
        status_lines(&self.ctx, self.sink.dropped())
    }

    /// Signal every task to stop and join them. The workers are joined as
    /// the node is dropped.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn spawn<T>(&mut self, name: &'static str, task: T) -> Result<(), NodeError>
    where
        T: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.into())
            .stack_size(self.config.task_stack_size)
            .spawn(task)
            .map_err(|_| NodeError::Spawn(name))?;
        self.tasks.push(handle);
        Ok(())
    }

    fn stop(&mut self) {
        if self.shutdown.take().is_none() {
            return;
        }
        log::info!("node {} stopping", self.ctx.identity);
        for task in self.tasks.drain(..) {
            let name = task.thread().name().unwrap_or("task").to_owned();
            if task.join().is_err() {
                log::error!("{} task panicked", name);
            }
        }
    }
}

impl<F: Filesystem> Drop for Node<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Monitor ──────────────────────────────────────────────────────────

fn run_monitor(ctx: NodeContext, sink: FrameSink, interval: Duration, shutdown: Receiver<()>) {
    log::info!("monitor started");
    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                for line in status_lines(&ctx, sink.dropped()) {
                    if let Ok(text) = core::str::from_utf8(&line) {
                        log::info!("{}", text.trim_end());
                    }
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::info!("monitor stopped");
}

fn status_lines(ctx: &NodeContext, overflow: u32) -> Vec<MsgBuffer> {
    let node = ctx.identity.to_heapless();
    let stats = ctx.stats.snapshot();
    let now = ctx.uptime.millis();
    let directory = lock_or_recover(&ctx.directory, "peers");

    let mut lines = Vec::with_capacity(1 + directory.active_count());
    let status = NodeMessage::Status {
        node: &node,
        uptime: ctx.uptime.secs(),
        peers: directory.active_count().min(u16::MAX.into()) as u16,
        capacity: directory.capacity().min(u16::MAX.into()) as u16,
        tx: stats.beacons_sent,
        skipped: stats.beacon_failures,
        rx: stats.beacons_received,
        rejected: stats.frames_rejected,
        overflow,
        board: board::BOARD_NAME,
        version: VERSION,
    };
    lines.extend(protocol::to_line(&status));

    for peer in directory.iter_active() {
        let id = peer.id.to_heapless();
        let msg = NodeMessage::Peer {
            id: &id,
            rssi: peer.rssi,
            age: peer.age(now),
            cap0: peer.capabilities[0],
        };
        lines.extend(protocol::to_line(&msg));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::StaticInput;
    use crate::dense::{DenseBuilder, DenseModelBuilder};
    use crate::storage::StdFs;
    use crate::transport::LoopbackHub;
    use std::time::Instant;

    fn test_config() -> NodeConfig {
        NodeConfig {
            beacon_interval_ms: 20,
            status_interval_ms: 0,
            max_peers: 4,
            ..NodeConfig::default()
        }
    }

    fn start_node(hub: &LoopbackHub, n: u8, root: &std::path::Path) -> Node<StdFs> {
        let identity = NodeId([0x02, 0, 0, 0, 0, n]);
        let model = DenseModelBuilder::seeded_projection(64, 32, n.into()).encode().unwrap();
        std::fs::create_dir_all(root.join("models")).unwrap();
        std::fs::write(root.join("models/capability.bin"), model).unwrap();

        let parts = NodeParts {
            identity,
            filesystem: StdFs::new(root),
            engine: DenseBuilder,
            transport: Box::new(hub.endpoint(identity, -40 - n as i8)),
            input: Box::new(StaticInput(vec![0; 256])),
        };
        Node::start(test_config(), parts).unwrap()
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn two_nodes_discover_each_other() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let hub = LoopbackHub::new();
        let a = start_node(&hub, 1, dir_a.path());
        let b = start_node(&hub, 2, dir_b.path());

        let found = wait_for(Duration::from_secs(10), || {
            a.peers().iter().any(|p| p.id == b.identity())
                && b.peers().iter().any(|p| p.id == a.identity())
        });
        assert!(found, "nodes did not discover each other");

        let peer_b = a.peers().into_iter().find(|p| p.id == b.identity()).unwrap();
        assert_eq!(peer_b.rssi, -42);
        assert!(peer_b.active);
        assert!(a.stats().beacons_sent > 0);
        assert!(a.peers().iter().all(|p| p.id != a.identity()));

        let report = a.status_report();
        let first = core::str::from_utf8(&report[0]).unwrap();
        assert!(first.contains(r#""type":"status""#));
        assert!(report.len() >= 2);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn storage_is_reachable_through_node() {
        let root = tempfile::tempdir().unwrap();
        let hub = LoopbackHub::new();
        let node = start_node(&hub, 3, root.path());

        let written = node.storage().write("notes/a.txt", b"hi".to_vec(), None).unwrap();
        assert_eq!(written, 2);
        assert_eq!(node.storage().read("notes/a.txt", None).unwrap(), b"hi");
        node.shutdown();
    }

    #[test]
    fn invalid_config_refuses_to_start() {
        let root = tempfile::tempdir().unwrap();
        let hub = LoopbackHub::new();
        let identity = NodeId([0x02, 0, 0, 0, 0, 9]);
        let parts = NodeParts {
            identity,
            filesystem: StdFs::new(root.path()),
            engine: DenseBuilder,
            transport: Box::new(hub.endpoint(identity, -40)),
            input: Box::new(StaticInput(vec![0; 256])),
        };
        let config = NodeConfig {
            max_peers: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(Node::start(config, parts), Err(NodeError::Config(_))));
    }

    #[test]
    fn missing_model_skips_beacons_until_stored() {
        let root = tempfile::tempdir().unwrap();
        let hub = LoopbackHub::new();
        let identity = NodeId([0x02, 0, 0, 0, 0, 7]);
        let parts = NodeParts {
            identity,
            filesystem: StdFs::new(root.path()),
            engine: DenseBuilder,
            transport: Box::new(hub.endpoint(identity, -40)),
            input: Box::new(StaticInput(vec![0; 256])),
        };
        let node = Node::start(test_config(), parts).unwrap();

        assert!(wait_for(Duration::from_secs(5), || node.stats().beacon_failures > 0));
        assert_eq!(node.stats().beacons_sent, 0);

        let model = DenseModelBuilder::seeded_projection(64, 32, 7).encode().unwrap();
        node.storage()
            .write("models/capability.bin", model, None)
            .unwrap();
        assert!(wait_for(Duration::from_secs(5), || node.stats().beacons_sent > 0));
        node.shutdown();
    }
}
