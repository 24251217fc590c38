//! BaseWorkflow (C9): signal/query surface (`instruct`, `approve`,
//! `get_event_log`), wait-for-human-approval coordination, notification
//! dispatch, and the concrete [`AgentTaskWorkflow`] run contract that ties
//! the Action Loop (C8) to a task's lifecycle.
//!
//! Everything here is workflow-plane code: the only non-deterministic
//! operations are `engine.execute_activity` calls, matching the
//! "everything external is an activity" rule (§5).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::instrument;

use crate::cloudllm::action_loop::{ActionLoop, LoopEvent};
use crate::cloudllm::activities::{
    ActivityName, AppendMessagesToThreadParams, DEFAULT_ROOT_THREAD_NAME,
};
use crate::cloudllm::engine::{ActivityOptions, WorkflowEngine};
use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::notification::{Notification, NotificationRequest};
use crate::cloudllm::state::Message;
use crate::cloudllm::task::Task;

/// Cooperative cancellation signal. Not part of the source's Temporal
/// binding (cancellation is a first-class engine primitive there); this is
/// the narrow stand-in the `LocalEngine` and its workflows use so `run` can
/// observe cancellation at any suspension point, per §5.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Signal payload for `instruct`. `thread_name` defaults to the root thread
/// but is fully caller-settable (§9 open question, resolved), so an
/// out-of-band human message can target any named thread, including one a
/// tool handler created mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInstruction {
    pub task_id: String,
    pub prompt: String,
    #[serde(default = "default_root_thread")]
    pub thread_name: String,
}

fn default_root_thread() -> String {
    DEFAULT_ROOT_THREAD_NAME.to_string()
}

impl HumanInstruction {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            thread_name: default_root_thread(),
        }
    }
}

/// Parameters a concrete workflow's `run` is invoked with.
#[derive(Debug, Clone)]
pub struct AgentTaskWorkflowParams {
    pub task: Task,
    pub require_approval: bool,
}

/// Signal/query state and helpers shared by every concrete workflow.
/// Mirrors the source's `BaseWorkflow` abstract class: `instruct`/`approve`
/// are idempotent external events, `get_event_log` is a synchronous read,
/// and `run` is left to [`AgentTaskWorkflow`].
pub struct BaseWorkflow {
    pub display_name: String,
    engine: Arc<dyn WorkflowEngine>,
    waiting_for_instruction: Arc<AtomicBool>,
    task_approved: Arc<AtomicBool>,
    event_log: Mutex<Vec<LoopEvent>>,
}

impl BaseWorkflow {
    pub fn new(display_name: impl Into<String>, engine: Arc<dyn WorkflowEngine>) -> Self {
        Self {
            display_name: display_name.into(),
            engine,
            waiting_for_instruction: Arc::new(AtomicBool::new(false)),
            task_approved: Arc::new(AtomicBool::new(false)),
            event_log: Mutex::new(Vec::new()),
        }
    }

    fn log(&self, event: &'static str, payload: serde_json::Value) {
        self.event_log
            .lock()
            .expect("event log poisoned")
            .push(LoopEvent { event, payload });
    }

    fn extend_event_log(&self, events: Vec<LoopEvent>) {
        self.event_log
            .lock()
            .expect("event log poisoned")
            .extend(events);
    }

    /// Query: a synchronous snapshot of the event log.
    pub fn get_event_log(&self) -> Vec<serde_json::Value> {
        self.event_log
            .lock()
            .expect("event log poisoned")
            .iter()
            .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null))
            .collect()
    }

    pub fn is_waiting_for_instruction(&self) -> bool {
        self.waiting_for_instruction.load(Ordering::SeqCst)
    }

    pub fn is_task_approved(&self) -> bool {
        self.task_approved.load(Ordering::SeqCst)
    }

    /// Signal: appends a `user` message to `instruction.thread_name` via the
    /// `append_messages_to_thread` activity, logs
    /// `human_instruction_received`, and releases any pending approval wait.
    /// Idempotent w.r.t. duplicate delivery: re-appending is the only
    /// observable effect, matching the source (no dedup key is defined for
    /// this signal).
    #[instrument(skip(self), fields(task_id = %instruction.task_id, thread_name = %instruction.thread_name))]
    pub async fn instruct(&self, instruction: HumanInstruction) -> Result<()> {
        let params = AppendMessagesToThreadParams {
            task_id: instruction.task_id.clone(),
            thread_name: instruction.thread_name.clone(),
            messages: vec![Message::user(instruction.prompt.clone())],
        };
        self.engine
            .execute_activity(
                ActivityName::APPEND_MESSAGES_TO_THREAD,
                serde_json::to_value(&params)?,
                ActivityOptions::caller_default(),
            )
            .await?;
        self.log(
            "human_instruction_received",
            serde_json::json!({"task_id": instruction.task_id, "thread_name": instruction.thread_name}),
        );
        self.waiting_for_instruction.store(false, Ordering::SeqCst);
        self.engine.notify_state_changed();
        Ok(())
    }

    /// Signal: latches `task_approved = true`. Duplicate delivery appends
    /// one additional `task_approved` event per delivery but leaves the
    /// latch (and any already-released wait) unaffected.
    pub fn approve(&self, _payload: Option<serde_json::Value>) {
        self.log("task_approved", serde_json::json!({}));
        self.task_approved.store(true, Ordering::SeqCst);
        self.engine.notify_state_changed();
    }

    #[instrument(skip(self, request))]
    async fn send_notification(&self, request: NotificationRequest) -> Result<Notification> {
        let raw = self
            .engine
            .execute_activity(
                ActivityName::SEND_NOTIFICATION,
                serde_json::to_value(&request)?,
                ActivityOptions::caller_default(),
            )
            .await?;
        serde_json::from_value(raw).map_err(|e| {
            AgentexError::service(format!("notification response coercion failed: {}", e))
        })
    }

    /// Sets `waiting_for_instruction`, sends a notification summarizing the
    /// agent's last content, then awaits `¬waiting_for_instruction ∨
    /// task_approved`. Returns once either an `instruct` or an `approve`
    /// signal has resolved the wait. If `approve` already latched before
    /// this call, no notification is sent (§8 testable property).
    pub async fn wait_for_approval(&self, topic: &str, last_content: &str) -> Result<()> {
        if self.is_task_approved() {
            return Ok(());
        }
        self.waiting_for_instruction.store(true, Ordering::SeqCst);
        self.send_notification(
            NotificationRequest::new(topic)
                .with_title(self.display_name.clone())
                .with_message(last_content.to_string()),
        )
        .await?;

        let waiting_flag = self.waiting_for_instruction.clone();
        let approved_flag = self.task_approved.clone();
        self.engine
            .wait_condition(Box::new(move || {
                !waiting_flag.load(Ordering::SeqCst) || approved_flag.load(Ordering::SeqCst)
            }))
            .await;
        Ok(())
    }
}

/// The concrete, end-to-end workflow the worker host registers: seeds the
/// root thread with instructions + prompt, runs the Action Loop, optionally
/// gates completion on human approval, and sends a final notification.
pub struct AgentTaskWorkflow {
    pub base: BaseWorkflow,
    engine: Arc<dyn WorkflowEngine>,
    action_loop: ActionLoop,
    model: String,
    instructions: String,
    action_registry_key: String,
    notification_topic: String,
}

impl AgentTaskWorkflow {
    pub fn new(
        display_name: impl Into<String>,
        instructions: impl Into<String>,
        model: impl Into<String>,
        action_registry_key: impl Into<String>,
        notification_topic: impl Into<String>,
        engine: Arc<dyn WorkflowEngine>,
    ) -> Self {
        Self {
            base: BaseWorkflow::new(display_name, engine.clone()),
            engine,
            action_loop: ActionLoop::default(),
            model: model.into(),
            instructions: instructions.into(),
            action_registry_key: action_registry_key.into(),
            notification_topic: notification_topic.into(),
        }
    }

    async fn seed_root_thread(&self, task: &Task) -> Result<()> {
        let params = AppendMessagesToThreadParams {
            task_id: task.id.clone(),
            thread_name: DEFAULT_ROOT_THREAD_NAME.to_string(),
            messages: vec![
                Message::system(self.instructions.clone()),
                Message::user(task.prompt.clone()),
            ],
        };
        self.engine
            .execute_activity(
                ActivityName::APPEND_MESSAGES_TO_THREAD,
                serde_json::to_value(&params)?,
                ActivityOptions::caller_default(),
            )
            .await?;
        Ok(())
    }

    async fn send_completion_notification(&self, content: &str) -> Result<()> {
        self.base
            .send_notification(
                NotificationRequest::new(self.notification_topic.clone())
                    .with_title(self.base.display_name.clone())
                    .with_message(content.to_string()),
            )
            .await?;
        Ok(())
    }

    /// Run contract (§4.11): seed, loop (Action Loop, then optionally wait
    /// for approval), send a completion notification, return `"completed"`.
    /// A cancellation observed at any suspension point logs `task_canceled`
    /// and is re-raised rather than swallowed.
    #[instrument(skip(self, cancel), fields(task_id = %params.task.id))]
    pub async fn run(
        &self,
        params: AgentTaskWorkflowParams,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.seed_root_thread(&params.task).await?;

        let content = loop {
            let mut loop_events = Vec::new();
            let run_loop = self.action_loop.run(
                &self.engine,
                &mut loop_events,
                &params.task.id,
                DEFAULT_ROOT_THREAD_NAME,
                &self.action_registry_key,
                &self.model,
            );
            tokio::pin!(run_loop);
            let loop_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = &mut run_loop => Some(result),
            };
            drop(run_loop);
            self.base.extend_event_log(loop_events);

            let content = match loop_result {
                None => {
                    self.base.log("task_canceled", serde_json::json!({}));
                    return Err(AgentexError::client("task canceled"));
                }
                Some(result) => result?,
            };

            if !params.require_approval {
                break content;
            }

            let wait = self.base.wait_for_approval(&self.notification_topic, &content);
            tokio::pin!(wait);
            let waited = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = &mut wait => Some(result),
            };
            drop(wait);
            match waited {
                None => {
                    self.base.log("task_canceled", serde_json::json!({}));
                    return Err(AgentexError::client("task canceled"));
                }
                Some(result) => result?,
            };

            if self.base.is_task_approved() {
                break content;
            }
        };

        self.send_completion_notification(&content).await?;
        self.base.log("task_completed", serde_json::json!({}));
        Ok("completed".to_string())
    }
}
