//! Single-step execution: input resolution, agent invocation with retry and
//! timeout, and output binding.
//!
//! Only the agent call is retried. Input resolution and output binding
//! failures are structural and end the step on the spot. Cancellation is
//! observed while an agent call is in flight and while waiting out a backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagent_types::agent::{AgentOutput, AgentRequest};
use dagent_types::error::{ResolutionError, StepError};
use dagent_types::event::WorkflowEventKind;
use dagent_types::workflow::{StepDefinition, StepResult, StepStatus};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{AgentRegistry, BoxAgent};
use crate::event::EventBridge;

use super::context::ContextSnapshot;
use super::expression::{Path, Scope, Template};
use super::retry::RetryHandler;

/// Scope root holding the step's own inputs resolved so far.
pub const LOCAL_INPUT_ROOT: &str = "input";

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs one step against a context snapshot and produces its `StepResult`.
///
/// Cheap to clone; the executor hands a clone to every spawned step task.
#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<AgentRegistry>,
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            default_timeout: None,
        }
    }

    /// Per-attempt timeout for steps that do not declare one.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute `step` and record how it ended.
    ///
    /// Never returns an error: every failure is captured in the result.
    /// Emits `StepStarted`, one `StepAttemptFinished` per agent call, and
    /// `StepFinished`.
    pub async fn execute(
        &self,
        step: &StepDefinition,
        context: &ContextSnapshot,
        bridge: &EventBridge,
        cancel: &CancellationToken,
    ) -> StepResult {
        let span = tracing::info_span!(
            "workflow.step",
            run_id = %bridge.run_id(),
            step = %step.name,
            agent = %step.agent_ref,
        );
        self.execute_inner(step, context, bridge, cancel)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        step: &StepDefinition,
        context: &ContextSnapshot,
        bridge: &EventBridge,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        bridge.emit(WorkflowEventKind::StepStarted {
            step: step.name.clone(),
            agent_ref: step.agent_ref.clone(),
        });

        let mut attempts = 0;
        let outcome = self
            .run(step, context, bridge, cancel, &mut attempts)
            .await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let (status, outputs, error) = match outcome {
            Ok(outputs) => (StepStatus::Succeeded, outputs, None),
            Err(StepError::Cancelled) => (StepStatus::Cancelled, Map::new(), Some(StepError::Cancelled)),
            Err(err) => (StepStatus::Failed, Map::new(), Some(err)),
        };

        match &error {
            None => tracing::debug!(attempts, duration_ms, "step succeeded"),
            Some(StepError::Cancelled) => tracing::info!(attempts, "step cancelled"),
            Some(err) => tracing::warn!(attempts, error = %err, "step failed"),
        }

        bridge.emit(WorkflowEventKind::StepFinished {
            step: step.name.clone(),
            status,
            attempts,
            duration_ms,
            error: error.as_ref().map(ToString::to_string),
        });

        StepResult {
            name: step.name.clone(),
            status,
            outputs,
            error,
            attempts,
            started_at: Some(started_at),
            finished_at: Utc::now(),
            duration_ms,
            skipped_because: None,
        }
    }

    async fn run(
        &self,
        step: &StepDefinition,
        context: &ContextSnapshot,
        bridge: &EventBridge,
        cancel: &CancellationToken,
        attempts: &mut u32,
    ) -> Result<Map<String, Value>, StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let inputs = resolve_inputs(step, &context.scope())?;
        let agent = self
            .registry
            .get(&step.agent_ref)
            .ok_or_else(|| StepError::AgentNotFound {
                agent_ref: step.agent_ref.clone(),
            })?;

        let policy = step.retry_policy.as_ref();
        let timeout = step.attempt_timeout().or(self.default_timeout);
        let mut previous_error = None;

        loop {
            *attempts += 1;
            let attempt = *attempts;
            let request = AgentRequest {
                run_id: bridge.run_id(),
                step: step.name.clone(),
                agent_ref: step.agent_ref.clone(),
                inputs: inputs.clone(),
                attempt,
                previous_error: previous_error.take(),
            };

            let attempt_clock = Instant::now();
            let invoked = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepError::Cancelled),
                r = invoke_with_timeout(agent, request, timeout) => r,
            };
            let result = invoked.and_then(|payload| apply_output_bindings(step, payload));
            let attempt_ms = attempt_clock.elapsed().as_millis() as u64;

            let err = match result {
                Ok(outputs) => {
                    bridge.emit(WorkflowEventKind::StepAttemptFinished {
                        step: step.name.clone(),
                        attempt,
                        error: None,
                        will_retry: false,
                        duration_ms: attempt_ms,
                    });
                    return Ok(outputs);
                }
                Err(err) => err,
            };

            let will_retry = RetryHandler::should_retry(policy, attempt, &err);
            bridge.emit(WorkflowEventKind::StepAttemptFinished {
                step: step.name.clone(),
                attempt,
                error: Some(err.to_string()),
                will_retry,
                duration_ms: attempt_ms,
            });
            if !will_retry {
                return Err(err);
            }

            let delay = RetryHandler::backoff_delay(policy, attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            previous_error = Some(err.to_string());

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn invoke_with_timeout(
    agent: &BoxAgent,
    request: AgentRequest,
    timeout: Option<Duration>,
) -> Result<AgentOutput, StepError> {
    let call = agent.invoke(request);
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result.map_err(StepError::AgentInvocation),
            Err(_) => Err(StepError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        },
        None => call.await.map_err(StepError::AgentInvocation),
    }
}

// ---------------------------------------------------------------------------
// Input and output binding
// ---------------------------------------------------------------------------

/// Resolve every input binding of `step`.
///
/// Bindings that read the step's own `input` root are deferred and resolved
/// in rounds against everything resolved so far, until a round makes no
/// progress. Chains of local references therefore resolve in any declaration
/// order. Any failure aborts the whole resolution, so the agent is never
/// invoked with partial inputs.
pub fn resolve_inputs(step: &StepDefinition, scope: &Scope<'_>) -> Result<Map<String, Value>, StepError> {
    let resolution = |input: &str| {
        let input = input.to_string();
        move |error: ResolutionError| StepError::Resolution { input, error }
    };

    let mut resolved = Map::new();
    let mut deferred = Vec::new();
    for (name, expression) in &step.input_bindings {
        let template = Template::parse(expression).map_err(resolution(name.as_str()))?;
        if template.references_root(LOCAL_INPUT_ROOT) {
            deferred.push((name, template));
            continue;
        }
        let value = template.resolve(scope).map_err(resolution(name.as_str()))?;
        resolved.insert(name.clone(), value);
    }

    let mut pending = deferred;
    while !pending.is_empty() {
        let attempted = pending.len();
        let local = Value::Object(resolved.clone());
        let local_scope = scope.clone().with(LOCAL_INPUT_ROOT, &local);
        let mut blocked = Vec::new();
        let mut first_error = None;
        for (name, template) in pending {
            match template.resolve(&local_scope) {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(error) => {
                    first_error.get_or_insert_with(|| resolution(name.as_str())(error));
                    blocked.push((name, template));
                }
            }
        }
        match first_error {
            Some(error) if blocked.len() == attempted => return Err(error),
            _ => pending = blocked,
        }
    }

    Ok(resolved)
}

/// Map an agent payload through the step's output bindings.
///
/// A binding's field may be a path into the payload (`meta.score`). With no
/// bindings the payload is published as-is.
pub fn apply_output_bindings(step: &StepDefinition, payload: AgentOutput) -> Result<Map<String, Value>, StepError> {
    if step.output_bindings.is_empty() {
        return Ok(payload);
    }

    let payload = Value::Object(payload);
    let mut outputs = Map::new();
    for (field, alias) in &step.output_bindings {
        let value = Path::parse(field)
            .ok()
            .and_then(|path| path.lookup(&payload).ok().cloned())
            .ok_or_else(|| StepError::OutputBinding {
                field: field.clone(),
                alias: alias.clone(),
            })?;
        outputs.insert(alias.clone(), value);
    }
    Ok(outputs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
