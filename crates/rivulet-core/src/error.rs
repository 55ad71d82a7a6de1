//! Error types for graph edits, session transitions and context setup.
//!
//! Nothing on the render path returns these. A quantum cannot fail; it
//! renders silence or stale state instead.

use thiserror::Error;

use crate::session::SessionState;

/// Errors from control-thread graph edits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Output index past the node's output count.
    #[error("output index {index} out of range (node has {count} outputs)")]
    OutputOutOfRange {
        /// Requested output index.
        index: usize,
        /// Number of outputs on the node.
        count: usize,
    },

    /// Input index past the node's input count.
    #[error("input index {index} out of range (node has {count} inputs)")]
    InputOutOfRange {
        /// Requested input index.
        index: usize,
        /// Number of inputs on the node.
        count: usize,
    },

    /// The two nodes were created by different contexts.
    #[error("nodes belong to different contexts")]
    ContextMismatch,

    /// Channel count outside `1..=max`.
    #[error("channel count {requested} outside 1..={max}")]
    InvalidChannelCount {
        /// Requested channel count.
        requested: usize,
        /// Largest channel count the context supports.
        max: usize,
    },

    /// The context has been closed or stopped.
    #[error("context is closed")]
    ContextClosed,
}

/// Errors delivered to session completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The request is not valid for this session kind or state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The session closed before the requested state was reached.
    #[error("session closed before reaching {target:?}")]
    Closed {
        /// State the request was waiting for.
        target: SessionState,
    },

    /// The completion channel was dropped without a result.
    #[error("completion dropped without a result")]
    Abandoned,
}

/// Errors from creating or driving a context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The process-wide live session limit has been reached.
    #[error("too many live sessions (limit {limit})")]
    TooManySessions {
        /// Configured limit.
        limit: usize,
    },

    /// Rejected context options.
    #[error("invalid context options: {0}")]
    InvalidOptions(String),

    /// A graph edit failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A session transition failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ContextError {
    /// Creates an [`InvalidOptions`](Self::InvalidOptions) error.
    pub fn invalid_options(reason: impl Into<String>) -> Self {
        Self::InvalidOptions(reason.into())
    }
}
