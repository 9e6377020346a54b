//! Error taxonomy shared by every node subsystem.
//!
//! Worker-side failures never cross the worker/caller boundary as panics:
//! they travel back inside a failed response, and the caller decides whether
//! to retry.

use thiserror::Error;

/// Broad class of a [`NodeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File open/read/write, missing or unusable model, arena exhaustion,
    /// transport or thread failures.
    Resource,
    /// Operation attempted in the wrong model lifecycle state.
    Lifecycle,
    /// Tensor binding does not fit the arena.
    Allocation,
    /// Malformed request payload. The model stays ready.
    Request,
    /// Engine invocation failure. The model moves to its error state.
    Inference,
    /// Queue full/closed or response timeout.
    Capacity,
    /// Malformed or wrong-size beacon frame or capability vector.
    Protocol,
    /// Rejected configuration.
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("open failed: {path}")]
    OpenFailed { path: String },

    #[error("short read: {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to spawn {0} thread")]
    Spawn(&'static str),

    #[error("invalid model: {0}")]
    InvalidModel(&'static str),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model not loaded")]
    ModelNotLoaded,

    #[error("model in error state; unload before reloading")]
    ModelFaulted,

    #[error("tensor allocation failed: need {required} bytes, arena has {available}")]
    TensorAllocation { required: usize, available: usize },

    #[error("arena allocation failed: {0} bytes")]
    ArenaAllocation(usize),

    #[error("unsupported operator: {0}")]
    UnsupportedOperator(&'static str),

    #[error("input size mismatch: expected {expected} bytes, got {actual}")]
    InputSizeMismatch { expected: usize, actual: usize },

    #[error("output size mismatch: expected {expected} bytes, got {actual}")]
    OutputSizeMismatch { expected: usize, actual: usize },

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("queue full")]
    QueueFull,

    #[error("queue closed")]
    QueueClosed,

    #[error("timed out waiting for response")]
    Timeout,

    #[error("bad frame size: expected {expected} bytes, got {actual}")]
    FrameSize { expected: usize, actual: usize },

    #[error("invalid config: {0}")]
    Config(&'static str),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::OpenFailed { .. }
            | NodeError::ShortRead { .. }
            | NodeError::ShortWrite { .. }
            | NodeError::Storage(_)
            | NodeError::Transport(_)
            | NodeError::Spawn(_)
            | NodeError::InvalidModel(_)
            | NodeError::ModelNotFound(_)
            | NodeError::ArenaAllocation(_)
            | NodeError::UnsupportedOperator(_) => ErrorKind::Resource,
            NodeError::ModelNotLoaded | NodeError::ModelFaulted => ErrorKind::Lifecycle,
            NodeError::TensorAllocation { .. } => ErrorKind::Allocation,
            NodeError::InputSizeMismatch { .. } => ErrorKind::Request,
            NodeError::InferenceFailed(_) => ErrorKind::Inference,
            NodeError::QueueFull | NodeError::QueueClosed | NodeError::Timeout => {
                ErrorKind::Capacity
            }
            NodeError::FrameSize { .. } | NodeError::OutputSizeMismatch { .. } => {
                ErrorKind::Protocol
            }
            NodeError::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_lead_with_the_failure_name() {
        let open = NodeError::OpenFailed { path: "a.bin".into() };
        assert!(open.to_string().starts_with("open failed"));
        assert!(NodeError::ShortRead { read: 1, expected: 2 }
            .to_string()
            .starts_with("short read"));
        assert!(NodeError::ShortWrite { written: 1, expected: 2 }
            .to_string()
            .starts_with("short write"));
        assert!(NodeError::ModelNotFound("m".into())
            .to_string()
            .starts_with("model not found"));
        assert_eq!(NodeError::ModelNotLoaded.to_string(), "model not loaded");
        assert!(NodeError::TensorAllocation { required: 8, available: 4 }
            .to_string()
            .starts_with("tensor allocation failed"));
        assert!(NodeError::InputSizeMismatch { expected: 8, actual: 4 }
            .to_string()
            .starts_with("input size mismatch"));
        assert!(NodeError::InferenceFailed("nan".into())
            .to_string()
            .starts_with("inference failed"));
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let short_write = NodeError::ShortWrite { written: 0, expected: 1 };
        assert_eq!(short_write.kind(), ErrorKind::Resource);
        assert_eq!(NodeError::ModelNotLoaded.kind(), ErrorKind::Lifecycle);
        assert_eq!(
            NodeError::TensorAllocation { required: 2, available: 1 }.kind(),
            ErrorKind::Allocation
        );
        assert_eq!(NodeError::InferenceFailed(String::new()).kind(), ErrorKind::Inference);
        assert_eq!(NodeError::QueueFull.kind(), ErrorKind::Capacity);
        let frame = NodeError::FrameSize { expected: 138, actual: 3 };
        assert_eq!(frame.kind(), ErrorKind::Protocol);
        assert_eq!(NodeError::Config("x").kind(), ErrorKind::Config);
    }

    #[test]
    fn load_failures_are_resource_errors() {
        assert_eq!(NodeError::ArenaAllocation(usize::MAX).kind(), ErrorKind::Resource);
        assert_eq!(NodeError::UnsupportedOperator("TANH").kind(), ErrorKind::Resource);
        assert_eq!(NodeError::InvalidModel("truncated").kind(), ErrorKind::Resource);
    }

    #[test]
    fn size_mismatches_split_by_origin() {
        let input = NodeError::InputSizeMismatch { expected: 8, actual: 4 };
        assert_eq!(input.kind(), ErrorKind::Request);
        let output = NodeError::OutputSizeMismatch { expected: 8, actual: 4 };
        assert_eq!(output.kind(), ErrorKind::Protocol);
    }
}
