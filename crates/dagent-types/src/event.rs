//! Lifecycle events emitted during a workflow run.
//!
//! `WorkflowEvent` is the envelope broadcast to bus subscribers and handed to
//! observers. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{StepStatus, WorkflowStatus};

/// One lifecycle event, stamped with its run and a per-run sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub run_id: Uuid,
    /// Monotonically increasing within a run, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// A run has started.
    WorkflowStarted {
        workflow_name: String,
        step_count: usize,
    },

    /// A step was dispatched and is resolving its inputs.
    StepStarted { step: String, agent_ref: String },

    /// One agent invocation finished (successfully or not).
    StepAttemptFinished {
        step: String,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        will_retry: bool,
        duration_ms: u64,
    },

    /// A step reached a terminal state.
    StepFinished {
        step: String,
        status: StepStatus,
        attempts: u32,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The run reached its final status.
    WorkflowFinished {
        workflow_name: String,
        status: WorkflowStatus,
        duration_ms: u64,
        steps_succeeded: usize,
    },

    /// A workflow-level error (output resolution, timeout, scheduling).
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        message: String,
    },
}

impl WorkflowEventKind {
    /// The step this event refers to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            WorkflowEventKind::StepStarted { step, .. }
            | WorkflowEventKind::StepAttemptFinished { step, .. }
            | WorkflowEventKind::StepFinished { step, .. } => Some(step),
            WorkflowEventKind::Error { step, .. } => step.as_deref(),
            WorkflowEventKind::WorkflowStarted { .. }
            | WorkflowEventKind::WorkflowFinished { .. } => None,
        }
    }
}
