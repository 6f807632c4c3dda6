//! Per-run step lifecycle tracking.

use std::collections::HashMap;

use dagent_types::workflow::StepStatus;
use thiserror::Error;

use super::dag::Dag;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("illegal transition for step '{step}': {from} -> {to}")]
    IllegalTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },
}

/// Current `StepStatus` of every step in a DAG.
///
/// Enforces the lifecycle table in `StepStatus::can_transition_to`; once a
/// step is terminal its status never changes.
#[derive(Debug, Clone)]
pub struct StepStates {
    states: HashMap<String, StepStatus>,
}

impl StepStates {
    /// Every step starts `Pending`.
    pub fn new(dag: &Dag) -> Self {
        Self {
            states: dag
                .steps()
                .iter()
                .map(|s| (s.name.clone(), StepStatus::Pending))
                .collect(),
        }
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.states.get(step).copied()
    }

    pub fn transition(&mut self, step: &str, to: StepStatus) -> Result<(), StateError> {
        let current = self
            .states
            .get_mut(step)
            .ok_or_else(|| StateError::UnknownStep(step.to_string()))?;
        if !current.can_transition_to(to) {
            return Err(StateError::IllegalTransition {
                step: step.to_string(),
                from: *current,
                to,
            });
        }
        *current = to;
        Ok(())
    }

    /// `Pending -> Ready -> Running`.
    pub fn mark_running(&mut self, step: &str) -> Result<(), StateError> {
        if self.status(step) == Some(StepStatus::Pending) {
            self.transition(step, StepStatus::Ready)?;
        }
        self.transition(step, StepStatus::Running)
    }

    pub fn finish(&mut self, step: &str, status: StepStatus) -> Result<(), StateError> {
        self.transition(step, status)
    }

    pub fn skip(&mut self, step: &str) -> Result<(), StateError> {
        self.transition(step, StepStatus::Skipped)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.states.values().filter(|s| **s == status).count()
    }

    /// Steps not yet terminal.
    pub fn unfinished(&self) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagent_types::workflow::StepDefinition;

    fn states() -> StepStates {
        let dag = Dag::build(vec![
            StepDefinition::new("a", "x"),
            StepDefinition::new("b", "x").depends_on(["a"]),
        ])
        .unwrap();
        StepStates::new(&dag)
    }

    #[test]
    fn test_all_start_pending() {
        let states = states();
        assert_eq!(states.status("a"), Some(StepStatus::Pending));
        assert_eq!(states.count(StepStatus::Pending), 2);
        assert!(!states.all_terminal());
        assert_eq!(states.status("zzz"), None);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut states = states();
        states.mark_running("a").unwrap();
        assert_eq!(states.status("a"), Some(StepStatus::Running));
        states.finish("a", StepStatus::Succeeded).unwrap();
        states.skip("b").unwrap();
        assert!(states.all_terminal());
        assert!(states.unfinished().is_empty());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut states = states();
        states.mark_running("a").unwrap();
        states.finish("a", StepStatus::Failed).unwrap();

        let err = states.finish("a", StepStatus::Succeeded).unwrap_err();
        assert_eq!(
            err,
            StateError::IllegalTransition {
                step: "a".into(),
                from: StepStatus::Failed,
                to: StepStatus::Succeeded,
            }
        );
        assert!(states.skip("a").is_err());
        assert!(states.mark_running("a").is_err());
    }

    #[test]
    fn test_running_step_cannot_be_skipped() {
        let mut states = states();
        states.mark_running("a").unwrap();
        assert!(states.skip("a").is_err());
    }

    #[test]
    fn test_unknown_step() {
        let mut states = states();
        assert_eq!(
            states.skip("nope").unwrap_err(),
            StateError::UnknownStep("nope".into())
        );
    }
}
