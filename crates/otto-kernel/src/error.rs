//! Crate-level error types for `otto-kernel`.
//!
//! Two distinct layers live here and must not be conflated:
//!
//! - [`ErrorKind`] is *data*: the closed set of step-level failure kinds
//!   carried on a [`crate::plan::StepResult`]. The orchestrator state
//!   machine branches on it; tools never unwind through it.
//! - [`KernelError`] is the crate's Rust error type, composing sub-module
//!   errors via `#[from]` and propagated with
//!   [`error_stack::Report`] for context-carrying `?` chains.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure kinds used throughout the pipeline.
///
/// New kinds require a code change. The serialized form is the snake_case
/// name, which is also what the chat transport's `error` events carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// LLM output did not conform to the expected plan shape.
    PlannerUnparseable,
    /// The validator rejected the plan outright.
    PlanStructuralInvalid,
    /// A step named an action absent from the tool registry.
    ToolNotFound,
    /// The tool itself raised or returned an error.
    ToolInvocationError,
    /// The per-step deadline expired.
    ToolTimeout,
    /// A template reference pointed at a value that does not exist.
    ReferenceUnresolved,
    /// An upstream dependency did not succeed.
    DependencyFailed,
    /// The post-hoc verifier returned a `fail` verdict.
    VerifierFail,
    /// The finalizer detected a recorded promise that was not kept.
    CommitmentUnfulfilled,
    /// User-initiated cancellation.
    Cancelled,
    /// The reflection retry budget is exhausted.
    Unrecoverable,
}

impl ErrorKind {
    /// Kinds that end the interaction rather than feeding the reflector.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Unrecoverable)
    }

    /// Kinds for which a retry is worth attempting.
    pub fn retry_hint(&self) -> bool {
        matches!(
            self,
            Self::ToolTimeout | Self::ToolInvocationError | Self::ReferenceUnresolved
        )
    }

    /// Stable snake_case name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlannerUnparseable => "planner_unparseable",
            Self::PlanStructuralInvalid => "plan_structural_invalid",
            Self::ToolNotFound => "tool_not_found",
            Self::ToolInvocationError => "tool_invocation_error",
            Self::ToolTimeout => "tool_timeout",
            Self::ReferenceUnresolved => "reference_unresolved",
            Self::DependencyFailed => "dependency_failed",
            Self::VerifierFail => "verifier_fail",
            Self::CommitmentUnfulfilled => "commitment_unfulfilled",
            Self::Cancelled => "cancelled",
            Self::Unrecoverable => "unrecoverable",
        }
    }

    /// Plain-language phrase for user-facing replies. Internal detail stays
    /// in the trace.
    pub fn user_facing(&self) -> &'static str {
        match self {
            Self::PlannerUnparseable => "I could not work out a valid plan for this request",
            Self::PlanStructuralInvalid => "the plan I produced was not sound",
            Self::ToolNotFound => "a required tool is not available",
            Self::ToolInvocationError => "a tool ran into an error",
            Self::ToolTimeout => "a tool took too long to respond",
            Self::ReferenceUnresolved => "an intermediate result was missing",
            Self::DependencyFailed => "an earlier step did not complete",
            Self::VerifierFail => "a result did not pass verification",
            Self::CommitmentUnfulfilled => "part of what I promised was not completed",
            Self::Cancelled => "the request was cancelled",
            Self::Unrecoverable => "I ran out of ways to recover",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-level error type for `otto-kernel`.
///
/// Wraps each sub-module's typed error via `#[from]` so that the `?`
/// operator converts them automatically. Use
/// [`error_stack::Report<KernelError>`] (via [`KernelResult`]) to attach
/// human-readable context as the error propagates up the call stack.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A session-store error (load, flush, corrupt record handling).
    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    /// A configuration-related error.
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A language-model RPC error.
    #[error("Language model error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    /// A tool-registry error (duplicate registration, unknown lookup).
    #[error("Registry error: {0}")]
    Registry(#[from] crate::tool::RegistryError),

    /// A reasoning-trace error (frozen trace, unknown entry).
    #[error("Trace error: {0}")]
    Trace(#[from] crate::trace::TraceError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal / untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

impl KernelError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convenience result alias using [`error_stack::Report`].
///
/// Equivalent to `Result<T, error_stack::Report<KernelError>>`.
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
