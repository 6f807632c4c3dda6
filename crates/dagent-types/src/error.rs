use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentError;

/// A `${...}` expression could not be resolved against the execution context.
///
/// Every variant names the full path being resolved and the segment where
/// resolution stopped. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionError {
    #[error("invalid expression '{expression}': {reason}")]
    Syntax { expression: String, reason: String },

    #[error("missing key '{segment}' in path '{path}'")]
    MissingKey { path: String, segment: String },

    #[error("index {index} out of range (length {len}) at '{segment}' in path '{path}'")]
    IndexOutOfRange {
        path: String,
        segment: String,
        index: usize,
        len: usize,
    },

    #[error("cannot traverse into {found} at '{segment}' in path '{path}'")]
    NotTraversable {
        path: String,
        segment: String,
        found: String,
    },
}

impl ResolutionError {
    /// The offending path segment, when the failure happened during traversal.
    pub fn segment(&self) -> Option<&str> {
        match self {
            ResolutionError::Syntax { .. } => None,
            ResolutionError::MissingKey { segment, .. }
            | ResolutionError::IndexOutOfRange { segment, .. }
            | ResolutionError::NotTraversable { segment, .. } => Some(segment),
        }
    }
}

/// Why a single step ended in a non-success terminal state.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("input '{input}' could not be resolved: {error}")]
    Resolution {
        input: String,
        error: ResolutionError,
    },

    #[error("agent output field '{field}' (alias '{alias}') missing from payload")]
    OutputBinding { field: String, alias: String },

    #[error("agent invocation failed: {0}")]
    AgentInvocation(AgentError),

    #[error("attempt timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("no agent registered for '{agent_ref}'")]
    AgentNotFound { agent_ref: String },

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether another attempt may succeed.
    ///
    /// Only agent-side failures and timeouts are transient; resolution,
    /// output binding and lookup failures are structural.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::AgentInvocation(err) => err.retryable,
            StepError::Timeout { .. } => true,
            StepError::Resolution { .. }
            | StepError::OutputBinding { .. }
            | StepError::AgentNotFound { .. }
            | StepError::Cancelled => false,
        }
    }
}
