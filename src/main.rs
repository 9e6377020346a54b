//! swarmnode simulator
//!
//! Boots several nodes in one process on a loopback broadcast medium, each
//! with its own data directory, stores a beacon model through each node's
//! storage queue, lets them beacon for a while, and prints every node's
//! NDJSON status report.
//!
//! Usage: `swarmnode [NODES] [SECONDS]` (defaults: 3 nodes, 3 seconds).
//! Set `RUST_LOG=debug` for per-beacon logging.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};

use swarmnode::dense::{DenseBuilder, DenseModelBuilder};
use swarmnode::packet::CAPABILITY_LEN;
use swarmnode::storage::{model_path, StdFs};
use swarmnode::transport::LoopbackHub;
use swarmnode::{Node, NodeConfig, NodeId, NodeParts};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let count: u8 = arg(1, 3)?;
    let seconds: u64 = arg(2, 3)?;

    let config = NodeConfig {
        beacon_interval_ms: 250,
        status_interval_ms: 1000,
        peer_timeout_ms: 2000,
        ..NodeConfig::default()
    };
    let input_width = config.model_input_len / 4;
    let model_file = model_path(&config.model_dir, &config.default_model)
        .ok_or_else(|| anyhow!("invalid model id {}", config.default_model))?;

    let base = std::env::temp_dir().join("swarmnode-sim");
    let hub = LoopbackHub::new();
    let mut nodes = Vec::new();

    for n in 1..=count {
        // Locally administered unicast addresses.
        let identity = NodeId([0x02, 0x53, 0x57, 0x00, 0x00, n]);
        let root = base.join(format!("node{n}"));

        let parts = NodeParts {
            identity,
            filesystem: StdFs::new(&root),
            engine: DenseBuilder,
            transport: Box::new(hub.endpoint(identity, -35 - 5 * n.min(10) as i8)),
            input: Box::new(wave_input(input_width, f32::from(n))),
        };
        let node = Node::start(config.clone(), parts)
            .with_context(|| format!("starting node {identity}"))?;

        // The beacon task reloads the model on its next interval.
        let model = DenseModelBuilder::seeded_projection(input_width, CAPABILITY_LEN, n.into())
            .encode()?;
        let written = node.storage().write(&model_file, model, None)?;
        log::info!(
            "node {} stored {} ({} bytes) under {}",
            identity,
            model_file,
            written,
            root.display()
        );

        nodes.push(node);
    }

    thread::sleep(Duration::from_secs(seconds));

    let mut out = io::stdout().lock();
    for node in &nodes {
        for line in node.status_report() {
            out.write_all(&line)?;
        }
    }
    out.flush()?;

    for node in nodes {
        node.shutdown();
    }
    Ok(())
}

/// Sine-wave input tensor that drifts every sample.
fn wave_input(width: usize, freq: f32) -> impl FnMut() -> Vec<u8> + Send + 'static {
    let mut phase = 0.0f32;
    move || {
        phase += 0.1;
        (0..width)
            .flat_map(|k| ((k as f32 * 0.05 * freq) + phase).sin().to_le_bytes())
            .collect()
    }
}

fn arg<T: std::str::FromStr>(index: usize, default: T) -> anyhow::Result<T> {
    match std::env::args().nth(index) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("argument {index}: cannot parse {raw:?}")),
        None => Ok(default),
    }
}
