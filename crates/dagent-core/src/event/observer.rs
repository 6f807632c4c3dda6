//! Observer callbacks for workflow lifecycle transitions.

use dagent_types::event::{WorkflowEvent, WorkflowEventKind};

/// Receives lifecycle events in emission order.
///
/// Every method has a no-op default, so observers implement only what they
/// need. Return values are ignored and panics are caught at the dispatch
/// boundary; an observer can never change a step's outcome. Callbacks run on
/// a dedicated blocking thread, so a slow callback delays later callbacks
/// but never the steps themselves.
pub trait WorkflowObserver: Send + Sync {
    fn on_workflow_start(&self, _event: &WorkflowEvent) {}

    fn on_step_start(&self, _event: &WorkflowEvent) {}

    /// Called after every agent invocation, successful or not.
    fn on_step_attempt(&self, _event: &WorkflowEvent) {}

    /// Called when a step reaches a terminal state, skips included.
    fn on_step_end(&self, _event: &WorkflowEvent) {}

    fn on_workflow_end(&self, _event: &WorkflowEvent) {}

    fn on_error(&self, _event: &WorkflowEvent) {}
}

/// Route an event to the matching callback.
pub(crate) fn dispatch(observer: &dyn WorkflowObserver, event: &WorkflowEvent) {
    match event.kind {
        WorkflowEventKind::WorkflowStarted { .. } => observer.on_workflow_start(event),
        WorkflowEventKind::StepStarted { .. } => observer.on_step_start(event),
        WorkflowEventKind::StepAttemptFinished { .. } => observer.on_step_attempt(event),
        WorkflowEventKind::StepFinished { .. } => observer.on_step_end(event),
        WorkflowEventKind::WorkflowFinished { .. } => observer.on_workflow_end(event),
        WorkflowEventKind::Error { .. } => observer.on_error(event),
    }
}
