//! BoxAgent -- object-safe dynamic dispatch wrapper for `Agent`.
//!
//! 1. `AgentDyn` is an object-safe mirror of `Agent` with boxed futures
//! 2. Every `T: Agent` gets `AgentDyn` through a blanket impl
//! 3. `BoxAgent` wraps `Box<dyn AgentDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use dagent_types::agent::{AgentError, AgentOutput, AgentRequest};

use super::capability::Agent;

/// Object-safe version of [`Agent`] with a boxed future.
pub trait AgentDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + 'a>>;
}

impl<T: Agent> AgentDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, AgentError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased agent for runtime lookup by `agent_ref`.
///
/// `Agent` uses RPITIT and cannot be a trait object directly; `BoxAgent`
/// exposes the same call through `AgentDyn`.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn>,
}

impl BoxAgent {
    pub fn new<T: Agent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub async fn invoke(&self, request: AgentRequest) -> Result<AgentOutput, AgentError> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent").finish_non_exhaustive()
    }
}
