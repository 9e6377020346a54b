//! Model runtime: load, run and unload models on one worker thread.
//!
//! Each loaded model owns an engine instance and a fixed-size scratch arena.
//! Engines are built against the runtime's operator resolver. Every model
//! shares the same worker and the same table lock, so inference on different
//! models never overlaps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::engine::{EngineBuilder, InferenceEngine, OpResolver, ScratchArena};
use crate::error::NodeError;
use crate::worker::{Correlated, RequestId, WorkerQueue, WorkerSpec};

/// Supplies model bytes by id.
pub trait ModelSource: Send + 'static {
    fn fetch(&mut self, model_id: &str) -> Result<Vec<u8>, NodeError>;
}

/// Lifecycle of one model id.
///
/// `Unloaded → Loading → Ready ⇄ Running`, with `Error` reachable from
/// `Loading` and `Running` and left only through UNLOAD. `Loading` and
/// `Running` last for one handler dispatch, so callers see them only in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOp {
    Load,
    /// Raw input tensor bytes, moved to the worker.
    Run { input: Vec<u8> },
    Unload,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub id: RequestId,
    pub model_id: String,
    pub op: ModelOp,
}

impl Correlated for ModelRequest {
    fn request_id(&self) -> RequestId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub id: RequestId,
    /// State of the model after the operation.
    pub state: ModelState,
    /// Output tensor bytes for a successful RUN, `None` otherwise.
    pub result: Result<Option<Vec<u8>>, NodeError>,
}

impl ModelResponse {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn message(&self) -> String {
        match &self.result {
            Ok(_) => "ok".into(),
            Err(e) => e.to_string(),
        }
    }

    pub fn output(&self) -> Option<&[u8]> {
        match &self.result {
            Ok(Some(output)) => Some(output),
            _ => None,
        }
    }
}

impl Correlated for ModelResponse {
    fn request_id(&self) -> RequestId {
        self.id
    }
}

/// Model runtime parameters.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Scratch arena bytes allocated per loaded model.
    pub arena_size: usize,
    pub capacity: usize,
    pub stack_size: usize,
    pub resolver: OpResolver,
}

// ── Model table ──────────────────────────────────────────────────────

struct ModelContext {
    engine: Box<dyn InferenceEngine>,
    arena: ScratchArena,
    state: ModelState,
}

impl ModelContext {
    /// Copy `input` into the input tensor, invoke, and copy the output out.
    fn invoke(&mut self, input: &[u8]) -> Result<Vec<u8>, NodeError> {
        let region = self.engine.input();
        if input.len() != region.len {
            return Err(NodeError::InputSizeMismatch {
                expected: region.len,
                actual: input.len(),
            });
        }
        let available = self.arena.len();
        self.arena
            .region_mut(region)
            .ok_or(NodeError::TensorAllocation {
                required: region.end(),
                available,
            })?
            .copy_from_slice(input);

        self.engine.invoke(&mut self.arena)?;

        let region = self.engine.output();
        self.arena
            .region(region)
            .map(<[u8]>::to_vec)
            .ok_or(NodeError::TensorAllocation {
                required: region.end(),
                available,
            })
    }
}

/// Loaded models keyed by id. Owned by the model worker.
struct ModelTable {
    builder: Box<dyn EngineBuilder>,
    source: Box<dyn ModelSource>,
    resolver: OpResolver,
    arena_size: usize,
    models: HashMap<String, ModelContext>,
}

impl ModelTable {
    fn new(
        builder: Box<dyn EngineBuilder>,
        source: Box<dyn ModelSource>,
        resolver: OpResolver,
        arena_size: usize,
    ) -> Self {
        Self {
            builder,
            source,
            resolver,
            arena_size,
            models: HashMap::new(),
        }
    }

    fn handle(&mut self, request: ModelRequest) -> ModelResponse {
        let model_id = request.model_id.as_str();
        let result = match request.op {
            ModelOp::Load => self.load(model_id).map(|_| None),
            ModelOp::Run { input } => self.run(model_id, &input).map(Some),
            ModelOp::Unload => {
                self.unload(model_id);
                Ok(None)
            }
            ModelOp::Status => Ok(None),
        };

        if let Err(ref e) = result {
            log::warn!("model {} request {} failed: {}", model_id, request.id, e);
        }

        ModelResponse {
            id: request.id,
            state: self.state(model_id),
            result,
        }
    }

    fn state(&self, model_id: &str) -> ModelState {
        self.models
            .get(model_id)
            .map_or(ModelState::Unloaded, |ctx| ctx.state)
    }

    fn load(&mut self, model_id: &str) -> Result<(), NodeError> {
        match self.state(model_id) {
            ModelState::Ready | ModelState::Running => return Ok(()),
            ModelState::Error => return Err(NodeError::ModelFaulted),
            ModelState::Unloaded | ModelState::Loading => {}
        }

        log::info!("model {}: {:?}", model_id, ModelState::Loading);
        let bytes = self.source.fetch(model_id)?;
        let mut engine = self.builder.build(&bytes, &self.resolver)?;
        let (mut arena, bound) = match ScratchArena::allocate(self.arena_size) {
            Ok(arena) => (arena, Ok(())),
            Err(e) => (ScratchArena::empty(), Err(e)),
        };

        let bound = bound.and_then(|()| engine.allocate_tensors(&mut arena));
        let state = match bound {
            Ok(()) => ModelState::Ready,
            Err(_) => ModelState::Error,
        };
        log::info!(
            "model {}: {:?} ({} byte model, {} of {} arena bytes)",
            model_id,
            state,
            bytes.len(),
            engine.arena_required(),
            arena.len()
        );

        self.models.insert(
            model_id.into(),
            ModelContext {
                engine,
                arena,
                state,
            },
        );
        bound
    }

    fn run(&mut self, model_id: &str, input: &[u8]) -> Result<Vec<u8>, NodeError> {
        let ctx = self
            .models
            .get_mut(model_id)
            .filter(|ctx| ctx.state == ModelState::Ready)
            .ok_or(NodeError::ModelNotLoaded)?;

        ctx.state = ModelState::Running;
        let result = ctx.invoke(input);
        ctx.state = match &result {
            Ok(_) | Err(NodeError::InputSizeMismatch { .. }) => ModelState::Ready,
            Err(_) => ModelState::Error,
        };
        result
    }

    fn unload(&mut self, model_id: &str) {
        if self.models.remove(model_id).is_some() {
            log::info!("model {}: {:?}", model_id, ModelState::Unloaded);
        }
    }
}

// ── Runtime ──────────────────────────────────────────────────────────

pub struct ModelRuntime {
    queue: WorkerQueue<ModelRequest, ModelResponse>,
}

impl ModelRuntime {
    pub fn start(
        builder: impl EngineBuilder,
        source: impl ModelSource,
        settings: ModelSettings,
    ) -> Result<Self, NodeError> {
        let table = ModelTable::new(
            Box::new(builder),
            Box::new(source),
            settings.resolver,
            settings.arena_size,
        );
        let spec = WorkerSpec {
            name: "model",
            capacity: settings.capacity,
            stack_size: settings.stack_size,
        };
        let queue = WorkerQueue::spawn(spec, Arc::new(Mutex::new(table)), ModelTable::handle)?;
        Ok(Self { queue })
    }

    pub fn next_request_id(&self) -> RequestId {
        self.queue.next_request_id()
    }

    pub fn request_load(&self, model_id: &str, id: RequestId) -> Result<(), NodeError> {
        self.submit(model_id, ModelOp::Load, id)
    }

    pub fn request_inference(
        &self,
        model_id: &str,
        input: Vec<u8>,
        id: RequestId,
    ) -> Result<(), NodeError> {
        self.submit(model_id, ModelOp::Run { input }, id)
    }

    pub fn request_unload(&self, model_id: &str, id: RequestId) -> Result<(), NodeError> {
        self.submit(model_id, ModelOp::Unload, id)
    }

    pub fn request_status(&self, model_id: &str, id: RequestId) -> Result<(), NodeError> {
        self.submit(model_id, ModelOp::Status, id)
    }

    /// Next response from the worker; `None` on timeout.
    pub fn response(&self, timeout: Option<Duration>) -> Option<ModelResponse> {
        match timeout {
            Some(timeout) => self.queue.poll_timeout(timeout),
            None => self.queue.poll(),
        }
    }

    /// Submit `op` under a fresh request id and wait for its response.
    ///
    /// Not meant to be mixed with concurrent callers on the same runtime:
    /// responses for other ids are discarded while waiting.
    pub fn call(
        &self,
        model_id: &str,
        op: ModelOp,
        timeout: Option<Duration>,
    ) -> Result<ModelResponse, NodeError> {
        let request = ModelRequest {
            id: self.next_request_id(),
            model_id: model_id.into(),
            op,
        };
        self.queue.call(request, timeout)
    }

    pub fn shutdown(self) {
        self.queue.shutdown();
    }

    fn submit(&self, model_id: &str, op: ModelOp, id: RequestId) -> Result<(), NodeError> {
        self.queue.submit(ModelRequest {
            id,
            model_id: model_id.into(),
            op,
        })
    }
}
