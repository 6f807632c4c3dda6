//! Agent capability boundary.
//!
//! - `Agent`: RPITIT trait for concrete agent implementations
//! - `BoxAgent`: object-safe wrapper for dynamic dispatch
//! - `AgentRegistry`: explicit name-indexed lookup handed to the executor

pub mod box_agent;
pub mod capability;
pub mod registry;

pub use box_agent::BoxAgent;
pub use capability::{Agent, FnAgent};
pub use registry::AgentRegistry;
