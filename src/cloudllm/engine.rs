//! Workflow Orchestration Contract (C7): the narrow interface a durable
//! workflow engine must satisfy, plus `LocalEngine`, a cooperative in-process
//! reference implementation suitable for single-process hosting and tests.
//!
//! Per the design notes, the Rust ecosystem has no equivalently mature
//! durable-execution client to the one the source binds directly. Rather
//! than fabricate a dependency on one, this module draws the trait boundary
//! so that a real distributed engine's client could implement
//! [`WorkflowEngine`] without any workflow or activity code changing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cloudllm::errors::{AgentexError, Result};

/// Retry policy attached to an activity invocation. `maximum_attempts = 0`
/// means unlimited attempts (the library default); callers SHOULD override
/// with a finite value.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub maximum_attempts: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self {
            maximum_attempts: 0,
            initial_backoff: Duration::from_millis(50),
        }
    }

    pub fn max_attempts(n: u32) -> Self {
        Self {
            maximum_attempts: n,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl Default for RetryPolicy {
    /// Callers typically override this with [`RetryPolicy::max_attempts`];
    /// the bare library default is unlimited attempts.
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Timeout + retry options threaded through `execute_activity`.
#[derive(Debug, Clone, Copy)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl ActivityOptions {
    /// The library-wide floor: a 10s timeout with unlimited retries.
    pub fn default_floor() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::unlimited(),
        }
    }

    /// The shape callers typically use: a 60s timeout with up to 5 attempts.
    pub fn caller_default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::max_attempts(5),
        }
    }
}

/// A single named, side-effecting unit the engine can invoke. Activities are
/// type-erased at this boundary (JSON in, JSON out); typed wrappers live in
/// [`crate::cloudllm::activities`].
#[async_trait]
pub trait ActivityFn: Send + Sync {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value>;
}

/// The narrow interface a durable workflow engine must satisfy: activity
/// invocation with retry/timeout, and a condition wait used for
/// approval-gating. Signal and query handling is modeled as ordinary method
/// calls on the workflow object itself (see
/// [`crate::cloudllm::workflow::BaseWorkflow`]) rather than as engine
/// callbacks, matching how the source's decorators dispatch directly into
/// workflow instance methods.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Invoke the named activity with `input`, retrying per `options` until
    /// it succeeds, a non-retryable error is returned, or attempts are
    /// exhausted.
    async fn execute_activity(
        &self,
        name: &str,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Result<serde_json::Value>;

    /// Suspend until `predicate` returns `true`. Implementations MUST poll
    /// or wake on every state change that could flip the predicate (signal
    /// delivery, in this crate).
    async fn wait_condition(&self, predicate: Box<dyn Fn() -> bool + Send + Sync>);

    /// Notify any waiting `wait_condition` callers that workflow state
    /// changed and the predicate should be re-evaluated. Called by signal
    /// handlers after mutating workflow state.
    fn notify_state_changed(&self);
}

/// Cooperative, single-process reference [`WorkflowEngine`]. Activities run
/// on the caller's tokio runtime; `wait_condition` polls against a
/// [`Notify`] so signal delivery wakes the waiter promptly instead of
/// busy-spinning.
pub struct LocalEngine {
    activities: Mutex<HashMap<String, Arc<dyn ActivityFn>>>,
    wake: Notify,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self {
            activities: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a named activity. Re-registering a name replaces the prior
    /// handler.
    pub async fn register(&self, name: impl Into<String>, activity: Arc<dyn ActivityFn>) {
        self.activities.lock().await.insert(name.into(), activity);
    }
}

#[async_trait]
impl WorkflowEngine for LocalEngine {
    async fn execute_activity(
        &self,
        name: &str,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Result<serde_json::Value> {
        let activity = {
            let activities = self.activities.lock().await;
            activities
                .get(name)
                .cloned()
                .ok_or_else(|| AgentexError::service(format!("no activity registered for '{}'", name)))?
        };

        // A run id correlates every attempt of this invocation across
        // retries in the tracing output, the way a real durable-execution
        // engine's activity task token would.
        let run_id = uuid::Uuid::new_v4();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call = activity.call(input.clone());
            let outcome = tokio::time::timeout(options.start_to_close_timeout, call).await;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => AgentexError::transient(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("activity '{}' exceeded start_to_close_timeout", name),
                )),
            };

            if !err.is_retryable() {
                return Err(err);
            }
            let exhausted = options.retry_policy.maximum_attempts != 0
                && attempt >= options.retry_policy.maximum_attempts;
            if exhausted {
                warn!(activity = name, %run_id, attempt, "activity retries exhausted");
                return Err(err);
            }
            info!(activity = name, %run_id, attempt, error = %err, "retrying activity");
            sleep(options.retry_policy.initial_backoff).await;
        }
    }

    async fn wait_condition(&self, predicate: Box<dyn Fn() -> bool + Send + Sync>) {
        loop {
            if predicate() {
                return;
            }
            // Race the notify against a bounded poll interval: signal
            // delivery wakes us immediately, but we also re-check
            // periodically in case of a lost wakeup (the notify permit is
            // consumed by a check that ran a moment earlier).
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = sleep(Duration::from_millis(25)) => {}
            }
        }
    }

    fn notify_state_changed(&self) {
        self.wake.notify_waiters();
    }
}

/// Adapts a typed `async fn(Req) -> Result<Resp>` into a JSON-boundary
/// [`ActivityFn`] for registration with a [`WorkflowEngine`].
pub struct TypedActivity<F> {
    func: F,
}

impl<F> TypedActivity<F> {
    pub fn new(func: F) -> Arc<Self> {
        Arc::new(Self { func })
    }
}

#[async_trait]
impl<F, Fut, Req, Resp> ActivityFn for TypedActivity<F>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Resp>> + Send,
    Req: serde::de::DeserializeOwned + Send,
    Resp: serde::Serialize + Send,
{
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value> {
        let req: Req = serde_json::from_value(input)
            .map_err(|e| AgentexError::service(format!("activity argument coercion failed: {}", e)))?;
        let resp = (self.func)(req).await?;
        serde_json::to_value(resp)
            .map_err(|e| AgentexError::service(format!("activity response coercion failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize)]
    struct Args {
        n: u32,
    }

    #[derive(Debug, Serialize, PartialEq)]
    struct Out {
        doubled: u32,
    }

    #[tokio::test]
    async fn execute_activity_dispatches_by_name_and_coerces_types() {
        let engine = LocalEngine::new();
        engine
            .register(
                "double",
                TypedActivity::new(|args: Args| async move { Ok(Out { doubled: args.n * 2 }) }),
            )
            .await;

        let result = engine
            .execute_activity(
                "double",
                serde_json::json!({"n": 21}),
                ActivityOptions::default_floor(),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"doubled": 42}));
    }

    #[tokio::test]
    async fn execute_activity_unknown_name_is_service_error() {
        let engine = LocalEngine::new();
        let err = engine
            .execute_activity("missing", serde_json::json!({}), ActivityOptions::default_floor())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentexError::Service(_)));
    }

    #[tokio::test]
    async fn execute_activity_retries_transient_failures_until_success() {
        let engine = LocalEngine::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        engine
            .register(
                "flaky",
                TypedActivity::new(move |_args: Args| {
                    let calls = calls_clone.clone();
                    async move {
                        let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if attempt < 2 {
                            Err(AgentexError::transient(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "flaky",
                            )))
                        } else {
                            Ok(Out { doubled: 0 })
                        }
                    }
                }),
            )
            .await;

        let result = engine
            .execute_activity(
                "flaky",
                serde_json::json!({"n": 1}),
                ActivityOptions {
                    start_to_close_timeout: Duration::from_secs(5),
                    retry_policy: RetryPolicy::max_attempts(5),
                },
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn execute_activity_does_not_retry_client_errors() {
        let engine = LocalEngine::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        engine
            .register(
                "bad_input",
                TypedActivity::new(move |_args: Args| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<Out, _>(AgentexError::client("nope"))
                    }
                }),
            )
            .await;

        let err = engine
            .execute_activity(
                "bad_input",
                serde_json::json!({"n": 1}),
                ActivityOptions {
                    start_to_close_timeout: Duration::from_secs(5),
                    retry_policy: RetryPolicy::max_attempts(5),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentexError::Client(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_condition_returns_once_predicate_flips_true() {
        let engine = Arc::new(LocalEngine::new());
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_clone = flag.clone();
        let engine_clone = engine.clone();
        let waiter = tokio::spawn(async move {
            engine_clone
                .wait_condition(Box::new(move || flag_clone.load(Ordering::SeqCst)))
                .await;
        });

        sleep(Duration::from_millis(10)).await;
        flag.store(true, Ordering::SeqCst);
        engine.notify_state_changed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_condition should return promptly")
            .unwrap();
    }
}
