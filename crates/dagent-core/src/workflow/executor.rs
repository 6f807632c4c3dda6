//! Workflow executor: ready-set driven DAG execution with a concurrency limit.
//!
//! The `DagExecutor` repeatedly computes the ready set, dispatches up to
//! `concurrency_limit` steps onto a `tokio::JoinSet`, and waits for at least
//! one to finish. Each finished step is recorded in `StepStates`, its outputs
//! are published to the `ExecutionContext`, and failures are propagated to
//! dependents as skips before the next ready set is computed.
//!
//! # Execution flow
//!
//! 1. Register a cancellation token under a fresh `run_id`.
//! 2. Emit `WorkflowStarted`.
//! 3. Loop: propagate skips -> dispatch ready steps -> await one completion.
//! 4. On cancellation or workflow timeout, stop dispatching, cancel running
//!    steps, and skip everything still pending.
//! 5. Resolve the declared workflow outputs against the final context.
//! 6. Emit `WorkflowFinished` and drain observers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dagent_types::agent::AgentError;
use dagent_types::config::EngineConfig;
use dagent_types::error::{ResolutionError, StepError};
use dagent_types::event::{WorkflowEvent, WorkflowEventKind};
use dagent_types::workflow::{StepResult, StepStatus, WorkflowStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::AgentRegistry;
use crate::event::{EventBridge, EventBus, WorkflowObserver};

use super::context::ExecutionContext;
use super::dag::Dag;
use super::state::StepStates;
use super::step_runner::StepExecutor;

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Workflow-level errors recorded in a `WorkflowResult`.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorError {
    /// A step failed and was not allowed to.
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: StepError },

    /// A declared workflow output could not be resolved.
    #[error("workflow output '{output}' could not be resolved: {error}")]
    OutputResolution {
        output: String,
        error: ResolutionError,
    },

    /// The scheduler reached a state it should never reach.
    #[error("internal scheduling error: {reason}")]
    InternalScheduling { reason: String },

    /// The whole run exceeded its deadline.
    #[error("workflow timed out after {timeout_ms}ms")]
    WorkflowTimeout { timeout_ms: u64 },

    /// The run was cancelled.
    #[error("workflow cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// WorkflowResult
// ---------------------------------------------------------------------------

/// Complete record of one run, including partial results of failed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    /// Every step's result in completion order, skipped and cancelled included.
    pub step_results: Vec<StepResult>,
    /// Resolved workflow outputs, keyed by output name.
    pub final_outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_errors: Vec<ExecutorError>,
    /// The first fatal error encountered, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<ExecutorError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowResult {
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.name == name)
    }

    /// Every failure of the run: failed steps (tolerated ones included),
    /// output resolution errors, and any run-level error.
    pub fn errors(&self) -> Vec<ExecutorError> {
        let mut errors: Vec<ExecutorError> = self
            .step_results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .filter_map(|r| {
                r.error.clone().map(|error| ExecutorError::StepFailed {
                    step: r.name.clone(),
                    error,
                })
            })
            .collect();
        errors.extend(self.output_errors.iter().cloned());
        if let Some(err) = &self.first_error {
            let run_level = matches!(
                err,
                ExecutorError::InternalScheduling { .. }
                    | ExecutorError::WorkflowTimeout { .. }
                    | ExecutorError::Cancelled
            );
            if run_level {
                errors.push(err.clone());
            }
        }
        errors
    }

    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

/// Runs DAGs against an explicit agent registry.
///
/// One executor can drive many runs concurrently; each run is tracked by its
/// `run_id` so it can be cancelled from another task.
pub struct DagExecutor {
    step_executor: StepExecutor,
    config: EngineConfig,
    event_bus: EventBus,
    observers: Vec<Arc<dyn WorkflowObserver>>,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl DagExecutor {
    pub fn new(registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        let config = config.validated();
        Self {
            step_executor: StepExecutor::new(registry)
                .with_default_timeout(config.default_step_timeout()),
            event_bus: EventBus::new(config.event_buffer_capacity),
            config,
            observers: Vec::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Attach an observer that receives every event of every run.
    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run ids of runs currently executing.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.cancellation_tokens.iter().map(|e| *e.key()).collect()
    }

    /// Request cancellation of a live run. Returns `false` if no such run.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Execute with the configured default concurrency.
    pub async fn run(&self, dag: &Dag, inputs: Value) -> WorkflowResult {
        self.execute(dag, inputs, self.config.default_concurrency)
            .await
    }

    pub async fn execute(&self, dag: &Dag, inputs: Value, concurrency_limit: usize) -> WorkflowResult {
        self.execute_with_cancel(dag, inputs, concurrency_limit, CancellationToken::new())
            .await
    }

    /// Execute `dag` until every step is terminal.
    ///
    /// Cancelling `cancel` (or calling `cancel(run_id)`) cancels running
    /// steps at their agent call or backoff, and skips steps not yet started.
    pub async fn execute_with_cancel(
        &self,
        dag: &Dag,
        inputs: Value,
        concurrency_limit: usize,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let run_id = Uuid::now_v7();
        let run_token = cancel.child_token();
        self.cancellation_tokens.insert(run_id, run_token.clone());
        let _registration = RunRegistration {
            tokens: &self.cancellation_tokens,
            run_id,
        };

        let span = tracing::info_span!("workflow.run", run_id = %run_id, workflow = %dag.name());
        self.drive(dag, inputs, concurrency_limit.max(1), run_id, run_token)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        dag: &Dag,
        inputs: Value,
        limit: usize,
        run_id: Uuid,
        run_token: CancellationToken,
    ) -> WorkflowResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let (bridge, dispatch) = EventBridge::start(
            run_id,
            Some(self.event_bus.clone()),
            self.observers.clone(),
        );

        tracing::info!(steps = dag.len(), concurrency_limit = limit, "workflow started");
        bridge.emit(WorkflowEventKind::WorkflowStarted {
            workflow_name: dag.name().to_string(),
            step_count: dag.len(),
        });

        let mut run = RunState::new(dag, &bridge, ExecutionContext::new(dag.name(), run_id, inputs));
        // Timeout cancels this child only, so it is distinguishable from a
        // caller cancellation.
        let steps_token = run_token.child_token();
        let workflow_timeout = self.config.workflow_timeout();
        let deadline = async move {
            match workflow_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut running: JoinSet<StepResult> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, String> = HashMap::new();
        let mut halted = false;

        loop {
            run.propagate_skips();

            if halted {
                run.skip_pending();
            } else {
                let ready: Vec<String> = dag
                    .ready_steps(&run.states)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                for name in ready {
                    if running.len() >= limit {
                        break;
                    }
                    let Some(step) = dag.step(&name).cloned() else {
                        continue;
                    };
                    if let Err(err) = run.states.mark_running(&name) {
                        run.fail(ExecutorError::InternalScheduling {
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    tracing::debug!(step = %name, in_flight = running.len() + 1, "dispatching step");

                    let snapshot = run.context.snapshot();
                    let executor = self.step_executor.clone();
                    let step_bridge = bridge.clone();
                    let token = steps_token.clone();
                    let handle = running.spawn(async move {
                        executor
                            .execute(&step, &snapshot, &step_bridge, &token)
                            .await
                    });
                    in_flight.insert(handle.id(), name);
                }
            }

            if running.is_empty() {
                run.check_stalled();
                break;
            }

            tokio::select! {
                biased;
                _ = run_token.cancelled(), if !halted => {
                    tracing::info!(running = running.len(), "workflow cancelled, stopping dispatch");
                    halted = true;
                }
                _ = &mut deadline, if !halted => {
                    let timeout_ms = workflow_timeout.map_or(0, |d| d.as_millis() as u64);
                    tracing::warn!(timeout_ms, running = running.len(), "workflow timed out");
                    halted = true;
                    steps_token.cancel();
                    run.fail(ExecutorError::WorkflowTimeout { timeout_ms });
                }
                joined = running.join_next_with_id() => match joined {
                    Some(Ok((id, result))) => {
                        in_flight.remove(&id);
                        run.record(result);
                    }
                    Some(Err(join_error)) => {
                        let name = in_flight.remove(&join_error.id()).unwrap_or_default();
                        tracing::error!(step = %name, error = %join_error, "step task aborted");
                        run.record(aborted_step(name, &join_error));
                    }
                    None => {}
                },
            }
        }

        let cancelled = run_token.is_cancelled();
        if cancelled {
            run.fail(ExecutorError::Cancelled);
        }
        run.resolve_outputs();

        let status = run.status(cancelled);
        let duration_ms = clock.elapsed().as_millis() as u64;
        let steps_succeeded = run.states.count(StepStatus::Succeeded);
        match status {
            WorkflowStatus::Succeeded => {
                tracing::info!(duration_ms, steps_succeeded, "workflow succeeded")
            }
            WorkflowStatus::Failed => tracing::warn!(
                duration_ms,
                steps_succeeded,
                error = ?run.first_error.as_ref().map(ToString::to_string),
                "workflow failed"
            ),
            WorkflowStatus::Cancelled => tracing::info!(duration_ms, steps_succeeded, "workflow cancelled"),
        }
        bridge.emit(WorkflowEventKind::WorkflowFinished {
            workflow_name: dag.name().to_string(),
            status,
            duration_ms,
            steps_succeeded,
        });
        dispatch.finish(self.config.observer_flush_timeout()).await;

        WorkflowResult {
            run_id,
            workflow_name: dag.name().to_string(),
            status,
            step_results: run.results,
            final_outputs: run.final_outputs,
            output_errors: run.output_errors,
            first_error: run.first_error,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }
}

/// Removes a run's cancellation token when the run ends or is dropped.
struct RunRegistration<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.run_id);
    }
}

/// Fails when nothing is running, nothing is ready, and steps remain.
fn ensure_progress(dag: &Dag, states: &StepStates, in_flight: usize) -> Result<(), ExecutorError> {
    if in_flight > 0 || states.all_terminal() || !dag.ready_steps(states).is_empty() {
        return Ok(());
    }
    let mut stuck = states.unfinished();
    stuck.sort_unstable();
    Err(ExecutorError::InternalScheduling {
        reason: format!(
            "no step is running or ready but {} remain unfinished: {}",
            stuck.len(),
            stuck.join(", ")
        ),
    })
}

fn aborted_step(name: String, join_error: &task::JoinError) -> StepResult {
    StepResult {
        name,
        status: StepStatus::Failed,
        outputs: Map::new(),
        error: Some(StepError::AgentInvocation(AgentError::permanent(format!(
            "step task ended abnormally: {join_error}"
        )))),
        attempts: 0,
        started_at: None,
        finished_at: Utc::now(),
        duration_ms: 0,
        skipped_because: None,
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Mutable bookkeeping of one run, owned by the scheduling loop.
struct RunState<'a> {
    dag: &'a Dag,
    bridge: &'a EventBridge,
    states: StepStates,
    context: ExecutionContext,
    results: Vec<StepResult>,
    /// Skipped step -> the failed or cancelled step at the root of the skip.
    skip_roots: HashMap<String, String>,
    final_outputs: Map<String, Value>,
    output_errors: Vec<ExecutorError>,
    first_error: Option<ExecutorError>,
}

impl<'a> RunState<'a> {
    fn new(dag: &'a Dag, bridge: &'a EventBridge, context: ExecutionContext) -> Self {
        Self {
            dag,
            bridge,
            states: StepStates::new(dag),
            context,
            results: Vec::with_capacity(dag.len()),
            skip_roots: HashMap::new(),
            final_outputs: Map::new(),
            output_errors: Vec::new(),
            first_error: None,
        }
    }

    /// Record a run error. Run-level errors are republished here; step and
    /// output errors were already emitted where they occurred.
    fn fail(&mut self, error: ExecutorError) {
        if matches!(
            error,
            ExecutorError::InternalScheduling { .. }
                | ExecutorError::WorkflowTimeout { .. }
                | ExecutorError::Cancelled
        ) {
            self.bridge.emit(WorkflowEventKind::Error {
                step: None,
                message: error.to_string(),
            });
        }
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }

    fn allows_failure(&self, step: &str) -> bool {
        self.dag.step(step).is_some_and(|s| s.allow_failure)
    }

    /// Apply a finished step's result.
    fn record(&mut self, result: StepResult) {
        if let Err(err) = self.states.finish(&result.name, result.status) {
            tracing::error!(step = %result.name, error = %err, "unexpected step transition");
            self.fail(ExecutorError::InternalScheduling {
                reason: err.to_string(),
            });
        }

        match result.status {
            StepStatus::Succeeded => {
                if let Err(err) = self.context.publish(&result.name, result.outputs.clone()) {
                    self.fail(ExecutorError::InternalScheduling {
                        reason: err.to_string(),
                    });
                }
            }
            StepStatus::Failed => {
                let error = result.error.clone().unwrap_or(StepError::Cancelled);
                self.bridge.emit(WorkflowEventKind::Error {
                    step: Some(result.name.clone()),
                    message: error.to_string(),
                });
                if self.allows_failure(&result.name) {
                    tracing::info!(step = %result.name, error = %error, "tolerated step failure");
                } else {
                    self.fail(ExecutorError::StepFailed {
                        step: result.name.clone(),
                        error,
                    });
                }
            }
            _ => {}
        }

        self.results.push(result);
    }

    /// Skip every pending step that can no longer run, to a fixpoint.
    fn propagate_skips(&mut self) {
        loop {
            let blocked: Vec<(String, String)> = self
                .dag
                .blocked_steps(&self.states)
                .into_iter()
                .map(|(step, dep)| (step.to_string(), dep.to_string()))
                .collect();
            if blocked.is_empty() {
                return;
            }
            for (step, dep) in blocked {
                let root = match self.states.status(&dep) {
                    Some(StepStatus::Skipped) => self.skip_roots.get(&dep).cloned(),
                    _ => Some(dep.clone()),
                };
                tracing::debug!(step = %step, dependency = %dep, root = ?root, "skipping step");
                self.skip(&step, root);
            }
        }
    }

    /// Nothing is in flight: any unfinished step left now is a deadlock.
    fn check_stalled(&mut self) {
        if let Err(err) = ensure_progress(self.dag, &self.states, 0) {
            tracing::error!(error = %err, "scheduler stalled");
            self.fail(err);
            self.skip_pending();
        }
    }

    /// Skip every step that has not started; used once the run has halted.
    fn skip_pending(&mut self) {
        let pending: Vec<String> = self
            .dag
            .steps()
            .iter()
            .filter(|s| {
                matches!(
                    self.states.status(&s.name),
                    Some(StepStatus::Pending | StepStatus::Ready)
                )
            })
            .map(|s| s.name.clone())
            .collect();
        for step in pending {
            self.skip(&step, None);
        }
    }

    fn skip(&mut self, step: &str, root: Option<String>) {
        if let Err(err) = self.states.skip(step) {
            self.fail(ExecutorError::InternalScheduling {
                reason: err.to_string(),
            });
            return;
        }
        if let Some(root) = &root {
            self.skip_roots.insert(step.to_string(), root.clone());
        }
        self.bridge.emit(WorkflowEventKind::StepFinished {
            step: step.to_string(),
            status: StepStatus::Skipped,
            attempts: 0,
            duration_ms: 0,
            error: None,
        });
        self.results.push(StepResult::skipped(step, root));
    }

    /// Whether this result is compatible with a successful run.
    fn tolerated(&self, result: &StepResult) -> bool {
        match result.status {
            StepStatus::Succeeded => true,
            StepStatus::Failed => self.allows_failure(&result.name),
            StepStatus::Skipped => result.skipped_because.as_deref().is_some_and(|root| {
                self.states.status(root) == Some(StepStatus::Failed) && self.allows_failure(root)
            }),
            _ => false,
        }
    }

    fn resolve_outputs(&mut self) {
        for (output, expression) in self.dag.outputs() {
            match self.context.resolve(expression) {
                Ok(value) => {
                    self.final_outputs.insert(output.clone(), value);
                }
                Err(error) => {
                    tracing::warn!(output = %output, error = %error, "workflow output unresolved");
                    self.bridge.emit(WorkflowEventKind::Error {
                        step: None,
                        message: format!("workflow output '{output}': {error}"),
                    });
                    self.output_errors.push(ExecutorError::OutputResolution {
                        output: output.clone(),
                        error,
                    });
                }
            }
        }
        if let Some(first) = self.output_errors.first().cloned() {
            self.fail(first);
        }
    }

    fn status(&self, cancelled: bool) -> WorkflowStatus {
        if cancelled {
            return WorkflowStatus::Cancelled;
        }
        let all_tolerated = self.results.iter().all(|r| self.tolerated(r));
        if self.first_error.is_none() && self.output_errors.is_empty() && all_tolerated {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, FnAgent};
    use dagent_types::agent::{AgentOutput, AgentRequest};
    use dagent_types::workflow::{DependencyMode, RetryPolicy, StepDefinition};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    fn payload(pairs: &[(&str, Value)]) -> AgentOutput {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    /// Returns the same payload on every call and counts invocations.
    fn fixed(calls: Arc<AtomicU32>, output: AgentOutput) -> impl Agent {
        FnAgent::new(move |_req: AgentRequest| {
            let calls = calls.clone();
            let output = output.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(output)
            }
        })
    }

    fn always_fail(calls: Arc<AtomicU32>) -> impl Agent {
        FnAgent::new(move |_req: AgentRequest| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::new("upstream unavailable"))
            }
        })
    }

    fn upper() -> impl Agent {
        FnAgent::new(|req: AgentRequest| async move {
            let text = req.input_str("text").unwrap_or_default().to_uppercase();
            Ok(payload(&[("text", json!(text))]))
        })
    }

    fn slow(calls: Arc<AtomicU32>, delay: Duration) -> impl Agent {
        FnAgent::new(move |_req: AgentRequest| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(payload(&[("done", json!(true))]))
            }
        })
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    fn executor(registry: AgentRegistry) -> DagExecutor {
        DagExecutor::new(Arc::new(registry), EngineConfig::default())
    }

    fn hello_dag() -> Dag {
        Dag::build(vec![
            StepDefinition::new("load", "load"),
            StepDefinition::new("shout", "upper")
                .depends_on(["load"])
                .input("text", "${steps.load.text}")
                .output("text", "shout_text"),
        ])
        .unwrap()
        .named("hello")
        .with_outputs(BTreeMap::from([(
            "shout_text".to_string(),
            "${steps.shout.shout_text}".to_string(),
        )]))
        .unwrap()
    }

    fn hello_registry(calls: Arc<AtomicU32>) -> AgentRegistry {
        AgentRegistry::new()
            .with("load", fixed(calls, payload(&[("text", json!("hello"))])))
            .with("upper", upper())
    }

    // -----------------------------------------------------------------------
    // Success paths
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_hello_workflow_final_output() {
        let exec = executor(hello_registry(counter()));
        let result = exec.execute(&hello_dag(), json!({}), 2).await;

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert!(result.succeeded());
        assert_eq!(result.workflow_name, "hello");
        assert_eq!(result.final_outputs["shout_text"], json!("HELLO"));
        assert!(result.step_results.iter().all(StepResult::succeeded));
        assert!(result.first_error.is_none());
        assert!(result.errors().is_empty());
        assert!(exec.active_runs().is_empty(), "run deregistered on completion");
    }

    #[tokio::test]
    async fn test_empty_dag_succeeds() {
        let exec = executor(AgentRegistry::new());
        let dag = Dag::build(Vec::new()).unwrap();
        let result = exec.run(&dag, Value::Null).await;
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert!(result.step_results.is_empty());
    }

    #[tokio::test]
    async fn test_workflow_inputs_reach_steps() {
        let exec = executor(AgentRegistry::new().with("upper", upper()));
        let dag = Dag::build(vec![
            StepDefinition::new("greet", "upper").input("text", "hi ${inputs.user.name}"),
        ])
        .unwrap()
        .with_outputs(BTreeMap::from([(
            "greeting".to_string(),
            "${steps.greet.text}".to_string(),
        )]))
        .unwrap();

        let result = exec.run(&dag, json!({ "user": { "name": "ada" } })).await;
        assert_eq!(result.final_outputs["greeting"], json!("HI ADA"));
    }

    #[tokio::test]
    async fn test_dependency_finishes_before_dependent_starts() {
        let exec = executor(hello_registry(counter()));
        let result = exec.execute(&hello_dag(), json!({}), 4).await;

        let load = result.step("load").unwrap();
        let shout = result.step("shout").unwrap();
        assert!(load.finished_at <= shout.started_at.unwrap());
        let order: Vec<&str> = result.step_results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["load", "shout"]);
    }

    // -----------------------------------------------------------------------
    // Failure propagation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_field_fails_workflow_but_keeps_upstream_result() {
        let calls = counter();
        let registry = AgentRegistry::new()
            .with("load", fixed(calls.clone(), payload(&[("text", json!("hello"))])))
            .with("transform", upper());
        let dag = Dag::build(vec![
            StepDefinition::new("load", "load"),
            StepDefinition::new("transform", "transform")
                .depends_on(["load"])
                .input("text", "${steps.load.missing_field}"),
        ])
        .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.step("load").unwrap().status, StepStatus::Succeeded);

        let transform = result.step("transform").unwrap();
        assert_eq!(transform.status, StepStatus::Failed);
        assert!(matches!(
            transform.error,
            Some(StepError::Resolution {
                error: ResolutionError::MissingKey { .. },
                ..
            })
        ));
        assert!(matches!(
            result.first_error,
            Some(ExecutorError::StepFailed { ref step, .. }) if step == "transform"
        ));
    }

    #[tokio::test]
    async fn test_failed_step_skips_dependents_without_invoking_them() {
        let downstream = counter();
        let registry = AgentRegistry::new()
            .with("fail", always_fail(counter()))
            .with("count", fixed(downstream.clone(), Map::new()));
        let dag = Dag::build(vec![
            StepDefinition::new("a", "fail"),
            StepDefinition::new("b", "count").depends_on(["a"]),
            StepDefinition::new("c", "count").depends_on(["b"]),
            StepDefinition::new("d", "count"),
        ])
        .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(downstream.load(Ordering::SeqCst), 1, "only the independent step runs");
        assert_eq!(result.step("d").unwrap().status, StepStatus::Succeeded);
        for name in ["b", "c"] {
            let skipped = result.step(name).unwrap();
            assert_eq!(skipped.status, StepStatus::Skipped);
            assert_eq!(skipped.attempts, 0);
            assert_eq!(skipped.skipped_because.as_deref(), Some("a"));
        }
        assert_eq!(result.step_results.len(), 4, "partial results are kept");
    }

    #[tokio::test]
    async fn test_retry_exhaustion_invokes_agent_max_attempts() {
        let calls = counter();
        let registry = AgentRegistry::new().with("fail", always_fail(calls.clone()));
        let dag = Dag::build(vec![
            StepDefinition::new("a", "fail").retry(RetryPolicy::immediate(3)),
        ])
        .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.step("a").unwrap().attempts, 3);
        assert_eq!(result.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_allow_failure_is_tolerated_with_its_skips() {
        let registry = AgentRegistry::new()
            .with("fail", always_fail(counter()))
            .with("ok", fixed(counter(), payload(&[("v", json!(1))])));
        let dag = Dag::build(vec![
            StepDefinition::new("optional", "fail").allow_failure(),
            StepDefinition::new("enrich", "ok").depends_on(["optional"]),
            StepDefinition::new("main", "ok"),
        ])
        .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(result.step("optional").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("enrich").unwrap().status, StepStatus::Skipped);
        assert!(result.first_error.is_none());
        assert_eq!(result.errors().len(), 1, "tolerated failures are still reported");
    }

    #[tokio::test]
    async fn test_skip_tolerant_dependent_runs_after_skip() {
        let registry = AgentRegistry::new()
            .with("fail", always_fail(counter()))
            .with("ok", fixed(counter(), payload(&[("v", json!(1))])));
        let dag = Dag::build(vec![
            StepDefinition::new("a", "fail").allow_failure(),
            StepDefinition::new("b", "ok").depends_on(["a"]),
            StepDefinition::new("report", "ok")
                .depends_on(["b"])
                .dependency_mode(DependencyMode::SucceededOrSkipped),
        ])
        .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("report").unwrap().status, StepStatus::Succeeded);
        assert_eq!(result.status, WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unresolvable_output_fails_successful_run() {
        let registry = AgentRegistry::new().with("ok", fixed(counter(), payload(&[("v", json!(1))])));
        let dag = Dag::build(vec![StepDefinition::new("a", "ok")])
            .unwrap()
            .with_outputs(BTreeMap::from([
                ("v".to_string(), "${steps.a.v}".to_string()),
                ("w".to_string(), "${steps.a.w}".to_string()),
            ]))
            .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.step_results.iter().all(StepResult::succeeded));
        assert_eq!(result.final_outputs["v"], json!(1));
        assert!(matches!(
            result.output_errors.as_slice(),
            [ExecutorError::OutputResolution { output, .. }] if output == "w"
        ));
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_bounds_in_flight_steps() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let tracked = FnAgent::new(move |_req: AgentRequest| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Map::new())
            }
        });
        let dag = Dag::build(vec![
            StepDefinition::new("a", "tracked"),
            StepDefinition::new("b", "tracked"),
            StepDefinition::new("c", "tracked"),
        ])
        .unwrap();

        let result = executor(AgentRegistry::new().with("tracked", tracked))
            .execute(&dag, json!({}), 2)
            .await;
        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        let c = result.step("c").unwrap();
        let first_done = result.step_results[0].finished_at;
        assert!(c.started_at.unwrap() >= first_done, "third step waits for a free slot");
    }

    #[tokio::test]
    async fn test_zero_limit_is_treated_as_one() {
        let exec = executor(hello_registry(counter()));
        let result = exec.execute(&hello_dag(), json!({}), 0).await;
        assert_eq!(result.status, WorkflowStatus::Succeeded);
    }

    // -----------------------------------------------------------------------
    // Cancellation and timeouts
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_run() {
        let calls = counter();
        let registry = AgentRegistry::new().with("slow", slow(calls.clone(), Duration::from_secs(60)));
        let dag = Dag::build(vec![
            StepDefinition::new("a", "slow"),
            StepDefinition::new("b", "slow").depends_on(["a"]),
            StepDefinition::new("c", "slow").depends_on(["a"]),
        ])
        .unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = executor(registry)
            .execute_with_cancel(&dag, json!({}), 4, cancel)
            .await;
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.step("a").unwrap().status, StepStatus::Cancelled);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("c").unwrap().status, StepStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no invocations after cancellation");
        assert_eq!(result.first_error, Some(ExecutorError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_run_id() {
        let registry = AgentRegistry::new().with("slow", slow(counter(), Duration::from_secs(60)));
        let exec = Arc::new(executor(registry));
        let mut events = exec.subscribe();
        let dag = Dag::build(vec![StepDefinition::new("a", "slow")]).unwrap();

        let runner = exec.clone();
        let handle = tokio::spawn(async move { runner.run(&dag, json!({})).await });

        let started = events.recv().await.unwrap();
        assert!(exec.active_runs().contains(&started.run_id));
        assert!(exec.cancel(started.run_id));
        assert!(!exec.cancel(Uuid::now_v7()));

        let result = handle.await.unwrap();
        assert_eq!(result.run_id, started.run_id);
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert!(exec.active_runs().is_empty());

        let cancelled = std::iter::from_fn(|| events.try_recv().ok()).any(|event| {
            matches!(
                event.kind,
                WorkflowEventKind::Error { step: None, ref message } if message == "workflow cancelled"
            )
        });
        assert!(cancelled, "cancellation is republished as a run-level error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_cancels_running_steps() {
        let registry = AgentRegistry::new().with("slow", slow(counter(), Duration::from_secs(60)));
        let config = EngineConfig {
            workflow_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let exec = DagExecutor::new(Arc::new(registry), config);
        let mut events = exec.subscribe();
        let dag = Dag::build(vec![
            StepDefinition::new("a", "slow"),
            StepDefinition::new("b", "slow").depends_on(["a"]),
        ])
        .unwrap();

        let result = exec.run(&dag, json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.first_error, Some(ExecutorError::WorkflowTimeout { timeout_ms: 1000 }));
        assert_eq!(result.step("a").unwrap().status, StepStatus::Cancelled);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);

        let mut run_errors = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkflowEventKind::Error { step: None, message } = event.kind {
                run_errors.push(message);
            }
        }
        assert_eq!(run_errors, vec!["workflow timed out after 1000ms"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_retries_then_fails() {
        let calls = counter();
        let registry = AgentRegistry::new().with("slow", slow(calls.clone(), Duration::from_secs(60)));
        let dag = Dag::build(vec![
            StepDefinition::new("a", "slow")
                .timeout(Duration::from_millis(500))
                .retry(RetryPolicy::immediate(3)),
        ])
        .unwrap();

        let result = executor(registry).run(&dag, json!({})).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.step("a").unwrap().error,
            Some(StepError::Timeout { timeout_ms: 500 })
        );
    }

    // -----------------------------------------------------------------------
    // Scheduling invariants
    // -----------------------------------------------------------------------

    #[test]
    fn test_stalled_schedule_is_reported() {
        let dag = Dag::build(vec![
            StepDefinition::new("a", "x"),
            StepDefinition::new("b", "x").depends_on(["a"]),
        ])
        .unwrap();
        let mut states = StepStates::new(&dag);
        // `a` stuck in Ready with nothing in flight: `b` can never run.
        states.transition("a", StepStatus::Ready).unwrap();

        assert!(ensure_progress(&dag, &states, 1).is_ok());
        let err = ensure_progress(&dag, &states, 0).unwrap_err();
        assert_eq!(
            err,
            ExecutorError::InternalScheduling {
                reason: "no step is running or ready but 2 remain unfinished: a, b".into()
            }
        );
    }

    #[test]
    fn test_executor_error_display() {
        let err = ExecutorError::StepFailed {
            step: "gather".into(),
            error: StepError::Timeout { timeout_ms: 10 },
        };
        assert!(err.to_string().contains("gather"));
        assert!(err.to_string().contains("10ms"));
        assert!(ExecutorError::Cancelled.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_workflow_result_serializes() {
        let result = executor(hello_registry(counter()))
            .run(&hello_dag(), json!({}))
            .await;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "succeeded");
        let back: WorkflowResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, tag: &str, event: &WorkflowEvent) {
            let step = event.kind.step().unwrap_or("-");
            self.seen.lock().unwrap().push(format!("{tag}:{step}"));
        }
    }

    impl WorkflowObserver for Recorder {
        fn on_workflow_start(&self, event: &WorkflowEvent) {
            self.push("workflow_start", event);
        }
        fn on_step_start(&self, event: &WorkflowEvent) {
            self.push("step_start", event);
        }
        fn on_step_end(&self, event: &WorkflowEvent) {
            self.push("step_end", event);
        }
        fn on_workflow_end(&self, event: &WorkflowEvent) {
            self.push("workflow_end", event);
        }
        fn on_error(&self, event: &WorkflowEvent) {
            self.push("error", event);
        }
    }

    /// Blocks its thread on every callback.
    struct Sluggish(Duration);

    impl WorkflowObserver for Sluggish {
        fn on_workflow_start(&self, _event: &WorkflowEvent) {
            std::thread::sleep(self.0);
        }
        fn on_step_start(&self, _event: &WorkflowEvent) {
            std::thread::sleep(self.0);
        }
        fn on_step_end(&self, _event: &WorkflowEvent) {
            std::thread::sleep(self.0);
        }
        fn on_workflow_end(&self, _event: &WorkflowEvent) {
            std::thread::sleep(self.0);
        }
    }

    struct Panicker;

    impl WorkflowObserver for Panicker {
        fn on_step_end(&self, _event: &WorkflowEvent) {
            panic!("observer failure");
        }
    }

    #[tokio::test]
    async fn test_observers_see_ordered_lifecycle() {
        let recorder = Arc::new(Recorder::default());
        let exec = executor(hello_registry(counter()))
            .with_observer(Arc::new(Panicker))
            .with_observer(recorder.clone());

        let result = exec.run(&hello_dag(), json!({})).await;
        assert_eq!(result.status, WorkflowStatus::Succeeded, "panicking observer is isolated");

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "workflow_start:-",
                "step_start:load",
                "step_end:load",
                "step_start:shout",
                "step_end:shout",
                "workflow_end:-",
            ]
        );
    }

    #[tokio::test]
    async fn test_observers_see_failures_and_skips() {
        let recorder = Arc::new(Recorder::default());
        let registry = AgentRegistry::new()
            .with("fail", always_fail(counter()))
            .with("ok", fixed(counter(), Map::new()));
        let dag = Dag::build(vec![
            StepDefinition::new("a", "fail"),
            StepDefinition::new("b", "ok").depends_on(["a"]),
        ])
        .unwrap();

        executor(registry)
            .with_observer(recorder.clone())
            .run(&dag, json!({}))
            .await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "workflow_start:-",
                "step_start:a",
                "step_end:a",
                "error:a",
                "step_end:b",
                "workflow_end:-",
            ]
        );
    }

    #[tokio::test]
    async fn test_blocking_observer_does_not_slow_steps() {
        let registry = AgentRegistry::new().with("slow", slow(counter(), Duration::from_millis(50)));
        let config = EngineConfig {
            observer_flush_timeout_ms: 100,
            ..EngineConfig::default()
        };
        let exec = DagExecutor::new(Arc::new(registry), config)
            .with_observer(Arc::new(Sluggish(Duration::from_millis(400))));
        let dag = Dag::build(vec![StepDefinition::new("a", "slow")]).unwrap();

        let clock = std::time::Instant::now();
        let result = exec.run(&dag, json!({})).await;
        let wall = clock.elapsed();

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        assert!(
            result.step("a").unwrap().duration_ms < 300,
            "step took {}ms",
            result.step("a").unwrap().duration_ms
        );
        assert!(wall < Duration::from_millis(1000), "run took {wall:?}");
    }

    #[tokio::test]
    async fn test_stalled_schedule_reaches_observers() {
        let dag = Dag::build(vec![
            StepDefinition::new("a", "x"),
            StepDefinition::new("b", "x").depends_on(["a"]),
        ])
        .unwrap();
        let recorder = Arc::new(Recorder::default());
        let observers: Vec<Arc<dyn WorkflowObserver>> = vec![recorder.clone()];
        let run_id = Uuid::now_v7();
        let (bridge, dispatch) = EventBridge::start(run_id, None, observers);

        let mut run = RunState::new(&dag, &bridge, ExecutionContext::new(dag.name(), run_id, json!({})));
        run.states.transition("a", StepStatus::Ready).unwrap();
        run.check_stalled();

        assert!(matches!(run.first_error, Some(ExecutorError::InternalScheduling { .. })));
        assert!(run.states.all_terminal(), "stalled steps are skipped");
        assert_eq!(run.status(false), WorkflowStatus::Failed);

        drop(run);
        assert!(dispatch.finish(Duration::from_secs(1)).await);
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["error:-", "step_end:a", "step_end:b"]);
    }
}
