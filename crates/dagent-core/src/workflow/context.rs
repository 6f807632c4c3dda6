//! Append-only execution context for a single workflow run.
//!
//! `ExecutionContext` holds the initial inputs and every completed step's
//! published outputs. Each step publishes exactly once, all of its aliases
//! together; nothing is ever overwritten. Readers work from a
//! `ContextSnapshot`, an immutable view that later publishes never change.

use std::sync::Arc;

use dagent_types::error::ResolutionError;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::expression::{Scope, Template};

/// Reserved scope roots.
pub const INPUTS_ROOT: &str = "inputs";
pub const STEPS_ROOT: &str = "steps";
pub const WORKFLOW_ROOT: &str = "workflow";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The step has already published its outputs.
    #[error("outputs for step '{step}' were already published")]
    AlreadyPublished { step: String },
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Write-once store of step outputs, owned by one executor run.
///
/// Shape seen by expressions:
/// ```json
/// {
///   "inputs":   { ...initial inputs... },
///   "steps":    { "<step>": { "<alias>": <value>, ... }, ... },
///   "workflow": { "name": "...", "run_id": "..." }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: Uuid,
    inputs: Arc<Value>,
    /// Copy-on-write: snapshots keep the old map alive while a publish
    /// builds the next one.
    steps: Arc<Value>,
    workflow: Arc<Value>,
}

impl ExecutionContext {
    /// Create an empty context seeded with the run's initial inputs.
    ///
    /// `Null` inputs become an empty object.
    pub fn new(workflow_name: &str, run_id: Uuid, inputs: Value) -> Self {
        let inputs = match inputs {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Self {
            run_id,
            inputs: Arc::new(inputs),
            steps: Arc::new(Value::Object(Map::new())),
            workflow: Arc::new(json!({
                "name": workflow_name,
                "run_id": run_id.to_string(),
            })),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// Publish all of a step's aliased outputs at once.
    ///
    /// Fails if the step already published; the context is unchanged in
    /// that case.
    pub fn publish(&mut self, step: &str, outputs: Map<String, Value>) -> Result<(), ContextError> {
        if self.has_published(step) {
            return Err(ContextError::AlreadyPublished {
                step: step.to_string(),
            });
        }
        if let Value::Object(map) = Arc::make_mut(&mut self.steps) {
            map.insert(step.to_string(), Value::Object(outputs));
        }
        Ok(())
    }

    pub fn has_published(&self, step: &str) -> bool {
        self.steps.get(step).is_some()
    }

    /// All outputs published by `step`.
    pub fn step_outputs(&self, step: &str) -> Option<&Map<String, Value>> {
        self.steps.get(step).and_then(Value::as_object)
    }

    pub fn get(&self, step: &str, alias: &str) -> Option<&Value> {
        self.step_outputs(step).and_then(|m| m.get(alias))
    }

    /// Number of steps that have published.
    pub fn published_count(&self) -> usize {
        self.steps.as_object().map_or(0, Map::len)
    }

    /// An immutable view of the current state.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            inputs: Arc::clone(&self.inputs),
            steps: Arc::clone(&self.steps),
            workflow: Arc::clone(&self.workflow),
        }
    }

    /// Resolve an expression against the current state.
    pub fn resolve(&self, expression: &str) -> Result<Value, ResolutionError> {
        Template::parse(expression)?.resolve(&self.snapshot().scope())
    }
}

// ---------------------------------------------------------------------------
// ContextSnapshot
// ---------------------------------------------------------------------------

/// Read-only view of an `ExecutionContext` at one point in time.
///
/// Cheap to clone and `Send`, so it can travel into a spawned step task.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    inputs: Arc<Value>,
    steps: Arc<Value>,
    workflow: Arc<Value>,
}

impl ContextSnapshot {
    /// Expression scope with the `inputs`, `steps` and `workflow` roots.
    pub fn scope(&self) -> Scope<'_> {
        Scope::new()
            .with(INPUTS_ROOT, &self.inputs)
            .with(STEPS_ROOT, &self.steps)
            .with(WORKFLOW_ROOT, &self.workflow)
    }

    /// The whole view as one JSON document.
    pub fn to_value(&self) -> Value {
        json!({
            INPUTS_ROOT: self.inputs.as_ref(),
            STEPS_ROOT: self.steps.as_ref(),
            WORKFLOW_ROOT: self.workflow.as_ref(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
