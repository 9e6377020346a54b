//! Inference engine seam: scratch arenas, operator resolution, and the traits
//! a concrete engine implements for the model runtime.

use heapless::Vec as HVec;

use crate::error::NodeError;

/// Maximum number of operators one resolver can register.
pub const MAX_OPERATORS: usize = 10;

// ── Scratch arena ────────────────────────────────────────────────────

/// Fixed-size scratch memory owned by one loaded model. Allocated once on
/// LOAD and released only when the model is unloaded.
pub struct ScratchArena {
    buf: Box<[u8]>,
}

impl ScratchArena {
    pub fn allocate(size: usize) -> Result<Self, NodeError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| NodeError::ArenaAllocation(size))?;
        buf.resize(size, 0);
        Ok(Self {
            buf: buf.into_boxed_slice(),
        })
    }

    /// Zero-length arena held by a model whose arena could not be allocated.
    pub fn empty() -> Self {
        Self { buf: Box::new([]) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes of `region`, or `None` if it does not fit in the arena.
    pub fn region(&self, region: TensorRegion) -> Option<&[u8]> {
        self.buf.get(region.offset..region.end())
    }

    pub fn region_mut(&mut self, region: TensorRegion) -> Option<&mut [u8]> {
        self.buf.get_mut(region.offset..region.end())
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Byte range of one tensor inside a [`ScratchArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorRegion {
    pub offset: usize,
    pub len: usize,
}

impl TensorRegion {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

// ── Operators ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operator {
    FullyConnected = 1,
    Relu = 2,
    Tanh = 3,
    Logistic = 4,
}

impl Operator {
    pub const ALL: [Operator; 4] = [
        Operator::FullyConnected,
        Operator::Relu,
        Operator::Tanh,
        Operator::Logistic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operator::FullyConnected => "FULLY_CONNECTED",
            Operator::Relu => "RELU",
            Operator::Tanh => "TANH",
            Operator::Logistic => "LOGISTIC",
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    /// Apply an element-wise activation. `FullyConnected` is the identity.
    pub fn activate(self, x: f32) -> f32 {
        match self {
            Operator::FullyConnected => x,
            Operator::Relu => x.max(0.0),
            Operator::Tanh => x.tanh(),
            Operator::Logistic => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Registry of the operators an engine may instantiate.
#[derive(Debug, Clone, Default)]
pub struct OpResolver {
    ops: HVec<Operator, MAX_OPERATORS>,
}

impl OpResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver with every built-in operator registered.
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        for op in Operator::ALL {
            // ALL is shorter than MAX_OPERATORS
            let _ = resolver.add(op);
        }
        resolver
    }

    pub fn add(&mut self, op: Operator) -> Result<(), NodeError> {
        if self.contains(op) {
            return Ok(());
        }
        self.ops
            .push(op)
            .map_err(|_| NodeError::Config("operator resolver full"))
    }

    pub fn contains(&self, op: Operator) -> bool {
        self.ops.contains(&op)
    }

    pub fn require(&self, op: Operator) -> Result<(), NodeError> {
        if self.contains(op) {
            Ok(())
        } else {
            Err(NodeError::UnsupportedOperator(op.name()))
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ── Engine traits ────────────────────────────────────────────────────

/// One instantiated model. Tensors live in a [`ScratchArena`] owned by the
/// caller; the engine only records where they are.
pub trait InferenceEngine: Send {
    /// Arena bytes needed to bind every tensor.
    fn arena_required(&self) -> usize;

    /// Bind tensors into `arena`. Fails with
    /// [`NodeError::TensorAllocation`] if the arena is too small.
    fn allocate_tensors(&mut self, arena: &mut ScratchArena) -> Result<(), NodeError>;

    fn input(&self) -> TensorRegion;

    fn output(&self) -> TensorRegion;

    /// Run the model over the input tensor already written to `arena`.
    fn invoke(&mut self, arena: &mut ScratchArena) -> Result<(), NodeError>;
}

/// Turns model bytes into an engine instance.
pub trait EngineBuilder: Send + 'static {
    /// Parse `model`, failing with [`NodeError::UnsupportedOperator`] if it
    /// uses an operator `resolver` does not register.
    fn build(
        &self,
        model: &[u8],
        resolver: &OpResolver,
    ) -> Result<Box<dyn InferenceEngine>, NodeError>;
}
