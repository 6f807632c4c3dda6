//! Shared domain types for the dagent workflow engine.
//!
//! Step and workflow definitions, run records, lifecycle events, engine
//! configuration and the error taxonomy shared by every layer.
//!
//! Zero runtime dependencies -- only serde, serde_json, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
