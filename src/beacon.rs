//! Beacon protocol: periodic capability broadcast and beacon ingest.
//!
//! Send path: RUN the beacon model, decode its output into the capability
//! vector, broadcast a [`BeaconPacket`]. An interval whose capability vector
//! cannot be computed sends nothing.
//!
//! Receive path: frames queued by the transport are validated, decoded and
//! upserted into the peer directory by the ingest task.

use std::time::Duration;

use crossbeam_channel::{select, Receiver, RecvTimeoutError};

use crate::error::NodeError;
use crate::model::{ModelOp, ModelResponse, ModelRuntime, ModelState};
use crate::node::NodeContext;
use crate::packet::{capabilities_from_bytes, BeaconPacket, Capabilities, NodeId};
use crate::peers::{PeerDirectory, Upsert};
use crate::stats::NodeStats;
use crate::transport::{PeerTransport, RxFrame};
use crate::worker::lock_or_recover;

/// Supplies the beacon model's input tensor each interval.
pub trait InputSource: Send + 'static {
    fn sample(&mut self) -> Vec<u8>;
}

/// The same input every interval.
#[derive(Debug, Clone)]
pub struct StaticInput(pub Vec<u8>);

impl InputSource for StaticInput {
    fn sample(&mut self) -> Vec<u8> {
        self.0.clone()
    }
}

impl<F> InputSource for F
where
    F: FnMut() -> Vec<u8> + Send + 'static,
{
    fn sample(&mut self) -> Vec<u8> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct BeaconSettings {
    pub model_id: String,
    pub interval: Duration,
    /// Bound on each model call; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Expire peers not heard for this long (ms); 0 disables expiry.
    pub peer_timeout_ms: u32,
}

// ── Send path ────────────────────────────────────────────────────────

pub struct BeaconTask {
    ctx: NodeContext,
    runtime: ModelRuntime,
    transport: Box<dyn PeerTransport>,
    input: Box<dyn InputSource>,
    settings: BeaconSettings,
}

impl BeaconTask {
    pub fn new(
        ctx: NodeContext,
        runtime: ModelRuntime,
        transport: Box<dyn PeerTransport>,
        input: Box<dyn InputSource>,
        settings: BeaconSettings,
    ) -> Self {
        Self {
            ctx,
            runtime,
            transport,
            input,
            settings,
        }
    }

    /// LOAD the beacon model. Returns whether it is ready.
    pub fn load_model(&self) -> bool {
        match self.model_call(ModelOp::Load) {
            Ok(response) if response.success() => true,
            Ok(response) => {
                log::warn!("beacon model {}: {}", self.settings.model_id, response.message());
                false
            }
            Err(e) => {
                log::warn!("beacon model {}: {}", self.settings.model_id, e);
                false
            }
        }
    }

    /// Run the beacon model and decode its output.
    ///
    /// A failed RUN that leaves the model `Unloaded` triggers a LOAD, and
    /// one that leaves it in `Error` an UNLOAD then LOAD, so the next
    /// interval can succeed.
    pub fn capabilities(&mut self) -> Result<Capabilities, NodeError> {
        let input = self.input.sample();
        let response = self.model_call(ModelOp::Run { input })?;

        if !response.success() {
            match response.state {
                ModelState::Unloaded => {
                    self.load_model();
                }
                ModelState::Error => {
                    log::warn!("beacon model {} faulted, reloading", self.settings.model_id);
                    if let Err(e) = self.model_call(ModelOp::Unload) {
                        log::warn!("unload {}: {}", self.settings.model_id, e);
                    }
                    self.load_model();
                }
                _ => {}
            }
        }

        let output = response
            .result?
            .ok_or_else(|| NodeError::InferenceFailed("no output tensor".into()))?;
        capabilities_from_bytes(&output)
    }

    /// One beacon interval: expire stale peers, then compute and broadcast.
    pub fn tick(&mut self) -> Result<(), NodeError> {
        if self.settings.peer_timeout_ms > 0 {
            let now = self.ctx.uptime.millis();
            lock_or_recover(&self.ctx.directory, "peers")
                .expire(now, self.settings.peer_timeout_ms);
        }

        let capabilities = match self.capabilities() {
            Ok(caps) => caps,
            Err(e) => {
                NodeStats::bump(&self.ctx.stats.beacon_failures);
                log::warn!("beacon skipped: {}", e);
                return Err(e);
            }
        };

        let packet = BeaconPacket {
            sender: self.ctx.identity,
            capabilities,
            timestamp: self.ctx.uptime.millis(),
        };
        if let Err(e) = self.transport.broadcast(&packet.encode()) {
            NodeStats::bump(&self.ctx.stats.beacon_failures);
            log::warn!("beacon broadcast failed: {}", e);
            return Err(e);
        }
        NodeStats::bump(&self.ctx.stats.beacons_sent);
        log::debug!("beacon sent at {} ms", packet.timestamp);
        Ok(())
    }

    /// Beacon loop. Runs until `shutdown` is closed, then stops the
    /// transport and shuts down the model runtime.
    pub fn run(mut self, shutdown: Receiver<()>) {
        log::info!(
            "beacon task started ({} every {} ms)",
            self.settings.model_id,
            self.settings.interval.as_millis()
        );
        self.load_model();

        loop {
            let _ = self.tick();
            match shutdown.recv_timeout(self.settings.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.transport.stop();
        self.runtime.shutdown();
        log::info!("beacon task stopped");
    }

    fn model_call(&self, op: ModelOp) -> Result<ModelResponse, NodeError> {
        self.runtime
            .call(&self.settings.model_id, op, self.settings.request_timeout)
    }
}

// ── Receive path ─────────────────────────────────────────────────────

/// Validate one received frame and upsert its sender.
///
/// Returns `Ok(None)` for the node's own beacons. Frames that are not
/// exactly one beacon long fail with [`NodeError::FrameSize`].
pub fn ingest(
    frame: &RxFrame,
    directory: &mut PeerDirectory,
    own_id: NodeId,
    now: u32,
) -> Result<Option<Upsert>, NodeError> {
    let packet = BeaconPacket::decode(&frame.data)?;
    if packet.sender == own_id {
        return Ok(None);
    }
    Ok(Some(directory.upsert(packet.sender, frame.rssi, &packet.capabilities, now)))
}

/// Drains the received-frame channel into the peer directory.
pub struct PeerListener {
    ctx: NodeContext,
}

impl PeerListener {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    pub fn handle(&self, frame: &RxFrame) {
        let now = self.ctx.uptime.millis();
        let result = {
            let mut directory = lock_or_recover(&self.ctx.directory, "peers");
            ingest(frame, &mut directory, self.ctx.identity, now)
        };

        let stats = &self.ctx.stats;
        match result {
            Ok(None) => {}
            Ok(Some(upsert)) => {
                NodeStats::bump(&stats.beacons_received);
                match upsert {
                    Upsert::Inserted(slot) => log::info!("new peer {} in slot {}", frame.src, slot),
                    Upsert::Updated(_) => {}
                    Upsert::Dropped => {
                        NodeStats::bump(&stats.peers_dropped);
                        log::debug!("peer directory full, dropped beacon from {}", frame.src);
                    }
                }
            }
            Err(e) => {
                NodeStats::bump(&stats.frames_rejected);
                log::debug!("rejected frame from {}: {}", frame.src, e);
            }
        }
    }

    /// Ingest loop. Runs until `shutdown` or the frame channel closes.
    pub fn run(self, frames: Receiver<RxFrame>, shutdown: Receiver<()>) {
        log::info!("peer listener started");
        loop {
            select! {
                recv(frames) -> frame => match frame {
                    Ok(frame) => self.handle(&frame),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        log::info!("peer listener stopped");
    }
}
