//! Workflow definition parsing, validation, and file loading.
//!
//! Converts between YAML documents and `WorkflowDefinition`, and checks the
//! constraints that do not need the dependency graph (name format, retry and
//! timeout sanity, expression syntax). Graph checks run through `Dag::build`.

use std::collections::HashSet;
use std::path::Path;

use dagent_types::workflow::{Backoff, WorkflowDefinition};
use thiserror::Error;

use super::dag::Dag;
use super::expression::Template;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or building a workflow. None of these can
/// occur once execution has started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references a step that does not exist.
    #[error("unknown dependency: step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    /// An input binding or workflow output is not a valid expression.
    #[error("expression error: {0}")]
    ExpressionError(String),
}

impl From<std::io::Error> for WorkflowError {
    fn from(err: std::io::Error) -> Self {
        WorkflowError::IoError(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// also builds into a `Dag`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load and validate a workflow definition from a YAML file.
pub async fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_workflow_yaml(&content).inspect_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "invalid workflow file");
    })
}

/// Load a workflow file straight into a `Dag`.
pub async fn load_workflow_dag(path: &Path) -> Result<Dag, WorkflowError> {
    let def = load_workflow_file(path).await?;
    Dag::from_definition(&def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one step exists
/// - Step names are non-empty and unique
/// - `retry.max_attempts >= 1`; exponential backoff is well-formed
/// - Timeout > 0 if set
/// - Every input binding and workflow output parses as an expression
/// - The steps form a valid DAG
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, hyphens and underscores allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.name.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "step name must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(WorkflowError::DuplicateStep(step.name.clone()));
        }
        if step.agent_ref.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has no agent",
                step.name
            )));
        }

        if let Some(retry) = &step.retry_policy {
            if retry.max_attempts < 1 {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}': retry.max_attempts must be >= 1",
                    step.name
                )));
            }
            if let Backoff::Exponential {
                base_delay_ms,
                multiplier,
                max_delay_ms,
            } = retry.backoff
            {
                if !(1.0..=10.0).contains(&multiplier) {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}': backoff multiplier must be between 1 and 10",
                        step.name
                    )));
                }
                if max_delay_ms < base_delay_ms {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}': max_delay_ms must be >= base_delay_ms",
                        step.name
                    )));
                }
            }
        }

        if step.timeout_ms == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}': timeout must be > 0",
                step.name
            )));
        }

        for (input, expression) in &step.input_bindings {
            Template::parse(expression).map_err(|e| {
                WorkflowError::ExpressionError(format!("step '{}' input '{input}': {e}", step.name))
            })?;
        }
    }

    Dag::from_definition(def)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
