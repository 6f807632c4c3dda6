//! Engine configuration types.
//!
//! `EngineConfig` represents an `engine.toml` that tunes scheduling limits,
//! timeouts and event delivery. Every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for `DagExecutor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency limit used when the caller does not pass one.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Per-attempt timeout for steps that do not declare their own.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,

    /// Whole-run deadline in seconds. 0 disables it.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,

    /// How long a finished run waits for observers to drain queued events.
    #[serde(default = "default_observer_flush_timeout_ms")]
    pub observer_flush_timeout_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_event_buffer_capacity() -> usize {
    1024
}

fn default_observer_flush_timeout_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            default_step_timeout_ms: None,
            workflow_timeout_secs: default_workflow_timeout_secs(),
            event_buffer_capacity: default_event_buffer_capacity(),
            observer_flush_timeout_ms: default_observer_flush_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Clamp values that would make the engine unusable.
    pub fn validated(mut self) -> Self {
        self.default_concurrency = self.default_concurrency.max(1);
        self.event_buffer_capacity = self.event_buffer_capacity.max(1);
        self
    }

    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        (self.workflow_timeout_secs > 0).then(|| Duration::from_secs(self.workflow_timeout_secs))
    }

    pub fn observer_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_flush_timeout_ms)
    }
}
