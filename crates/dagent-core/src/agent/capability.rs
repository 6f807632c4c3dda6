//! Agent trait definition.
//!
//! An agent is whatever sits behind a step's `agent_ref`: an LLM-backed task
//! handler, a tool, a test double. The engine only sees `invoke`.

use std::future::Future;

use dagent_types::agent::{AgentError, AgentOutput, AgentRequest};

/// Capability invoked once per step attempt.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Wrap in
/// `BoxAgent` to store heterogeneous agents in an `AgentRegistry`.
pub trait Agent: Send + Sync {
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> impl Future<Output = Result<AgentOutput, AgentError>> + Send;
}

/// Adapter that turns an async closure into an `Agent`.
///
/// ```ignore
/// let echo = FnAgent::new(|req: AgentRequest| async move { Ok(req.inputs) });
/// ```
pub struct FnAgent<F> {
    f: F,
}

impl<F> FnAgent<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(AgentRequest) -> Fut + Send + Sync,
        Fut: Future<Output = Result<AgentOutput, AgentError>> + Send,
    {
        Self { f }
    }
}

impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(AgentRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AgentOutput, AgentError>> + Send,
{
    fn invoke(
        &self,
        request: AgentRequest,
    ) -> impl Future<Output = Result<AgentOutput, AgentError>> + Send {
        (self.f)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use uuid::Uuid;

    fn request(text: &str) -> AgentRequest {
        let mut inputs = Map::new();
        inputs.insert("text".to_string(), json!(text));
        AgentRequest {
            run_id: Uuid::now_v7(),
            step: "s".to_string(),
            agent_ref: "echo".to_string(),
            inputs,
            attempt: 1,
            previous_error: None,
        }
    }

    #[tokio::test]
    async fn test_fn_agent_invokes_closure() {
        let echo = FnAgent::new(|req: AgentRequest| async move { Ok(req.inputs) });
        let out = echo.invoke(request("hi")).await.unwrap();
        assert_eq!(out["text"], json!("hi"));
    }

    #[tokio::test]
    async fn test_fn_agent_propagates_error() {
        let failing = FnAgent::new(|_req: AgentRequest| async move {
            Err::<AgentOutput, _>(AgentError::permanent("nope"))
        });
        let err = failing.invoke(request("hi")).await.unwrap_err();
        assert!(!err.retryable);
    }
}
