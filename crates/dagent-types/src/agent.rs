//! Request and error types for the agent invocation boundary.
//!
//! The engine never interprets what an agent does. It hands over resolved
//! inputs and receives either a payload map or an `AgentError`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Payload returned by a successful agent invocation: output field -> value.
pub type AgentOutput = Map<String, Value>;

/// Everything an agent receives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Run this invocation belongs to.
    pub run_id: Uuid,
    /// Name of the step being executed.
    pub step: String,
    /// The `agent_ref` the step was declared with.
    pub agent_ref: String,
    /// Resolved input bindings.
    pub inputs: Map<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error from the previous attempt, so an agent can correct course on retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_error: Option<String>,
}

impl AgentRequest {
    /// Look up a resolved input by name.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    /// Look up a resolved input as a string slice.
    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_str)
    }
}

/// Failure reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    /// Hint from the agent: `false` ends the retry loop early.
    pub retryable: bool,
}

impl AgentError {
    /// A transient failure; the step's retry policy applies.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_accessors() {
        let mut inputs = Map::new();
        inputs.insert("text".to_string(), json!("hello"));
        inputs.insert("count".to_string(), json!(3));
        let request = AgentRequest {
            run_id: Uuid::now_v7(),
            step: "shout".to_string(),
            agent_ref: "upper".to_string(),
            inputs,
            attempt: 1,
            previous_error: None,
        };
        assert_eq!(request.input_str("text"), Some("hello"));
        assert_eq!(request.input_str("count"), None);
        assert_eq!(request.input("count"), Some(&json!(3)));
    }

    #[test]
    fn test_previous_error_omitted_when_absent() {
        let request = AgentRequest {
            run_id: Uuid::now_v7(),
            step: "a".to_string(),
            agent_ref: "x".to_string(),
            inputs: Map::new(),
            attempt: 1,
            previous_error: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("previous_error").is_none());
    }
}
