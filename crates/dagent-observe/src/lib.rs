//! Observability setup for the dagent workflow engine.
//!
//! The engine itself only emits `tracing` spans and events; this crate owns
//! subscriber installation for binaries and test harnesses that embed it.

pub mod tracing_setup;
