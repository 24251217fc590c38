//! `Task` and `Agent` entities (§3). Creation, submission and admin deletion
//! of these live in the out-of-scope control plane (§1); this crate only
//! carries the shapes a workflow instance is started with and the status it
//! reports back.

use serde::{Deserialize, Serialize};

/// Terminal and non-terminal states a task's workflow instance can be in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Completed,
    Canceled,
    Failed,
    Terminated,
    TimedOut,
}

/// A user-submitted unit of work bound to one agent, executed as one
/// workflow instance keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub prompt: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            status: Some(TaskStatus::Running),
            status_reason: None,
        }
    }
}

/// Lifecycle status of an agent *definition*, as distinct from a running
/// task. Supplemented from the original source's agent-package lifecycle;
/// carried as data only — the core does not drive these transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum AgentStatus {
    Pending,
    Building,
    Ready,
    Failed,
    Unknown,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Unknown
    }
}

/// Identity and routing metadata for an agent. Immutable for the lifetime
/// of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    pub workflow_name: String,
    pub workflow_queue_name: String,
}
