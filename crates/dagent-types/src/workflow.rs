//! Workflow domain types.
//!
//! `WorkflowDefinition` is the declarative document a workflow is loaded
//! from; `StepDefinition` is the immutable description of one unit of work.
//! The run-record types (`StepStatus`, `StepResult`, `WorkflowStatus`) are
//! what the engine produces at its boundary.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StepError;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: a named set of steps plus declared outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name (alphanumeric, hyphens, underscores).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Steps forming the workflow DAG, in declaration order.
    pub steps: Vec<StepDefinition>,
    /// Workflow outputs: output name -> `${...}` expression resolved after the run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step name within a workflow.
    pub name: String,
    /// Opaque reference resolved to an agent by the registry.
    #[serde(rename = "agent")]
    pub agent_ref: String,
    /// Steps that must finish before this one becomes ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Local input name -> expression.
    #[serde(rename = "inputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_bindings: BTreeMap<String, String>,
    /// Payload field -> alias published into the context.
    ///
    /// When empty, every payload field is published under its own name.
    #[serde(rename = "outputs", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_bindings: BTreeMap<String, String>,
    /// Absent means a single attempt.
    #[serde(rename = "retry", default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// When true, this step failing does not fail the workflow.
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_failure: bool,
    #[serde(default, skip_serializing_if = "DependencyMode::is_default")]
    pub dependency_mode: DependencyMode,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, agent_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_ref: agent_ref.into(),
            depends_on: Vec::new(),
            input_bindings: BTreeMap::new(),
            output_bindings: BTreeMap::new(),
            retry_policy: None,
            timeout_ms: None,
            allow_failure: false,
            dependency_mode: DependencyMode::default(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.input_bindings.insert(name.into(), expression.into());
        self
    }

    pub fn output(mut self, field: impl Into<String>, alias: impl Into<String>) -> Self {
        self.output_bindings.insert(field.into(), alias.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn dependency_mode(mut self, mode: DependencyMode) -> Self {
        self.dependency_mode = mode;
        self
    }

    /// Per-attempt timeout, if one is declared.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Which dependency outcomes make a step ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// Every dependency must have succeeded.
    #[default]
    AllSucceeded,
    /// Skipped dependencies also count as satisfied.
    SucceededOrSkipped,
}

impl DependencyMode {
    fn is_default(&self) -> bool {
        *self == DependencyMode::AllSucceeded
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// How many times a step's agent invocation may be attempted, and how long
/// to wait between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl RetryPolicy {
    /// `max_attempts` attempts with no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms: 0 },
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base_delay_ms: base.as_millis() as u64,
                multiplier,
                max_delay_ms: max.as_millis() as u64,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

/// Delay shape between attempts.
///
/// ```yaml
/// retry:
///   max_attempts: 4
///   backoff:
///     type: exponential
///     base_delay_ms: 200
///     multiplier: 2.0
///     max_delay_ms: 5000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(default)]
        delay_ms: u64,
    },
    Exponential {
        base_delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        max_delay_ms: u64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 1000 }
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

/// Lifecycle state of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Legal lifecycle edges. Terminal states have no outgoing edges.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Immutable record of how one step finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    /// Published outputs, keyed by alias. Empty unless the step succeeded.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Final error (the last attempt's, not the first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Number of agent invocations made.
    pub attempts: u32,
    /// When input resolution began. `None` for steps that never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// For skipped steps: the failed or cancelled step that caused the skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<String>,
}

impl StepResult {
    /// Record for a step that was never dispatched.
    pub fn skipped(name: impl Into<String>, cause: Option<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            outputs: Map::new(),
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: Utc::now(),
            duration_ms: 0,
            skipped_because: cause,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Overall outcome of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
