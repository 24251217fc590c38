//! Error taxonomy for the task orchestrator.
//!
//! Every fallible operation in this crate returns [`AgentexError`]. The three
//! top-level variants mirror the propagation policy used by the workflow
//! runtime: [`AgentexError::Client`] and [`AgentexError::Service`] are never
//! retried, while [`AgentexError::Transient`] is the catch-all an activity
//! boundary wraps uncategorized failures in before handing them to the engine
//! (see [`crate::cloudllm::engine`]).

use thiserror::Error;

/// Unified error type threaded through repositories, services, activities and
/// the action registry.
#[derive(Debug, Error)]
pub enum AgentexError {
    /// Bad caller input: unknown action, invalid arguments, a duplicate
    /// artifact without `overwrite`, or a handler invoked without its
    /// reserved context. Surfaced to the caller; never retried.
    #[error("client error: {0}")]
    Client(String),
    /// An internal invariant was violated: corrupt state JSON, a registry
    /// lookup failing after schema generation succeeded, or similar. Surfaced
    /// to the operator; never retried.
    #[error("service error: {0}")]
    Service(String),
    /// Any uncategorized failure raised inside an activity body. The engine
    /// abstraction retries these per the activity's retry policy until
    /// attempts are exhausted.
    #[error("transient activity error: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl AgentexError {
    /// Build a [`AgentexError::Client`] from a display-able message.
    pub fn client(msg: impl Into<String>) -> Self {
        AgentexError::Client(msg.into())
    }

    /// Build a [`AgentexError::Service`] from a display-able message.
    pub fn service(msg: impl Into<String>) -> Self {
        AgentexError::Service(msg.into())
    }

    /// Wrap an arbitrary error as [`AgentexError::Transient`].
    pub fn transient(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        AgentexError::Transient(Box::new(err))
    }

    /// Whether the workflow engine should apply the activity's retry policy
    /// to this error. Only [`AgentexError::Transient`] is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentexError::Transient(_))
    }
}

impl From<serde_json::Error> for AgentexError {
    fn from(err: serde_json::Error) -> Self {
        AgentexError::Service(format!("json error: {}", err))
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for AgentexError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        AgentexError::Transient(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentexError>;
