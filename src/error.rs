//! Error types for approxql.
//!
//! All errors that can occur while planning, compressing or executing an
//! approximate query are represented by [`AqpError`]. Errors are propagated
//! via `Result<T, AqpError>` throughout the crate.
//!
//! # Error Classification
//!
//! Errors are classified into four categories:
//! - **Value**: invalid scramble configuration (an unrecognized method
//!   included), missing tokens, bad arguments. Raised synchronously, before
//!   any backend round trip.
//! - **Unsupported**: a query shape the planner does not handle.
//! - **Backend**: anything surfaced by the execution capability, wrapped
//!   without reinterpretation. Aborts are reported here as well.
//! - **Internal**: graph invariants broken. Indicates a bug.

use std::fmt;

/// Primary error type for the crate.
///
/// `Clone` so a single node failure can be published on every
/// broadcasting queue of the failing node.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AqpError {
    // ── Value errors ──────────────────────────────────────────────────────
    /// The scramble descriptor failed validation.
    #[error("invalid scramble: {0}")]
    InvalidScramble(String),

    /// Fewer tokens were delivered to a node than it declared placeholders.
    #[error("not enough tokens to resolve placeholders: expected {expected}, got {actual}")]
    MissingTokens { expected: usize, actual: usize },

    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The scramble method is not one of uniform, hash or fastconverge.
    /// Kept apart from [`AqpError::InvalidScramble`] so callers can tell
    /// the two apart; both are value errors.
    #[error("unsupported scramble method: {0}. Must be 'uniform', 'hash' or 'fastconverge'")]
    UnsupportedScrambleMethod(String),

    // ── Unsupported ───────────────────────────────────────────────────────
    /// The query uses a construct the planner cannot handle.
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    // ── Backend errors ────────────────────────────────────────────────────
    /// The backend rejected a statement or the connection failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Execution was aborted before this node could complete.
    #[error("execution aborted: {0}")]
    Aborted(String),

    // ── Internal errors ───────────────────────────────────────────────────
    /// The node graph contains a cycle.
    #[error("cycle detected in node graph: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A node id does not refer to a live node of the plan.
    #[error("node not found: {0}")]
    NodeNotFound(usize),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<postgres::Error> for AqpError {
    fn from(e: postgres::Error) -> Self {
        AqpError::Backend(e.to_string())
    }
}

/// Classification of error kind for logging and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AqpErrorKind {
    Value,
    Unsupported,
    Backend,
    Internal,
}

impl fmt::Display for AqpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AqpErrorKind::Value => write!(f, "VALUE"),
            AqpErrorKind::Unsupported => write!(f, "UNSUPPORTED"),
            AqpErrorKind::Backend => write!(f, "BACKEND"),
            AqpErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl AqpError {
    /// Classify the error.
    pub fn kind(&self) -> AqpErrorKind {
        match self {
            AqpError::InvalidScramble(_)
            | AqpError::UnsupportedScrambleMethod(_)
            | AqpError::MissingTokens { .. }
            | AqpError::InvalidArgument(_)
            | AqpError::InvalidConfig(_) => AqpErrorKind::Value,

            AqpError::UnsupportedQuery(_) => AqpErrorKind::Unsupported,

            AqpError::Backend(_) | AqpError::Aborted(_) => AqpErrorKind::Backend,

            AqpError::CycleDetected(_)
            | AqpError::NodeNotFound(_)
            | AqpError::InternalError(_) => AqpErrorKind::Internal,
        }
    }

    /// Whether this error was raised by validation before touching the backend.
    pub fn is_value_error(&self) -> bool {
        self.kind() == AqpErrorKind::Value
    }

    /// Whether this error came from (or on behalf of) the backend.
    pub fn is_backend_error(&self) -> bool {
        self.kind() == AqpErrorKind::Backend
    }

    /// Whether the error is the result of an explicit abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, AqpError::Aborted(_))
    }
}
