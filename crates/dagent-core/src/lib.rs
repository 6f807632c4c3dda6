//! Execution engine for agent workflows defined as step DAGs.
//!
//! Callers build a `Dag` (directly or from a YAML `WorkflowDefinition`),
//! register agent capabilities in an `AgentRegistry`, and hand both to a
//! `DagExecutor`. The engine never talks to a model or a database itself; it
//! only resolves expressions, schedules steps and reports what happened.

pub mod agent;
pub mod config;
pub mod event;
pub mod workflow;
