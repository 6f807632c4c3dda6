//! Workflow lifecycle events.
//!
//! - `EventBus`: broadcast fan-out of `WorkflowEvent` for streaming consumers
//! - `WorkflowObserver`: callback interface for lifecycle transitions
//! - `EventBridge`: the engine's single emission point, feeding both

pub mod bridge;
pub mod bus;
pub mod observer;

pub use bridge::{EventBridge, ObserverDispatch};
pub use bus::EventBus;
pub use observer::WorkflowObserver;
