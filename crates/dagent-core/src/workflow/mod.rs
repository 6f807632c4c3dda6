//! Workflow engine core: expression resolution, DAG construction and execution.
//!
//! - `expression` -- `${path}` templates and path traversal
//! - `context` -- append-only execution context with immutable snapshots
//! - `definition` -- YAML parsing, validation, filesystem load
//! - `dag` -- DAG builder, cycle detection, layers and ready-set computation
//! - `state` -- per-run step lifecycle tracking
//! - `retry` -- retry decisions and backoff delays
//! - `step_runner` -- single-step execution with retry and timeout
//! - `executor` -- concurrency-limited DAG executor

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod retry;
pub mod state;
pub mod step_runner;
