//! Core conversational state entities and the whole-document agent-state
//! repository (C2).
//!
//! [`Message`] is the tagged sum described in the design notes: a JSON
//! discriminator on `role` selects between [`Message::System`],
//! [`Message::User`], [`Message::Assistant`] and [`Message::Tool`].
//! [`AgentState`] is the single JSON document persisted per task id;
//! [`AgentStateRepository`] serializes/deserializes it as a whole-object
//! replace on top of a [`KeyValueRepository`](crate::cloudllm::kv::KeyValueRepository).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::kv::KeyValueRepository;

/// One piece of a multi-part message body (currently only exercised by
/// [`Message::Tool`], mirroring the source's `ContentPart` union).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// An image reference inside a [`ContentPart::ImageUrl`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default = "default_detail")]
    pub detail: String,
}

fn default_detail() -> String {
    "auto".to_string()
}

/// The body of a [`Message::Tool`]: either plain text or a list of
/// multi-modal content parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl std::fmt::Display for ToolContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolContent::Text(text) => write!(f, "{}", text),
            ToolContent::Parts(parts) => write!(f, "{}", serde_json::json!(parts)),
        }
    }
}

impl From<String> for ToolContent {
    fn from(s: String) -> Self {
        ToolContent::Text(s)
    }
}

impl From<&str> for ToolContent {
    fn from(s: &str) -> Self {
        ToolContent::Text(s.to_string())
    }
}

/// The function payload of a single [`ToolCallRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON text as generated by the model; not guaranteed to be valid
    /// JSON. Validated by the take-action activity before invocation.
    pub arguments: String,
}

/// A single tool invocation requested by the model in an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_function_type() -> String {
    "function".to_string()
}

/// Tagged-sum message type. Serializes with `role` as the JSON discriminator,
/// matching the polymorphic-message design note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ToolCallRequest>,
        #[serde(default)]
        parsed: Option<serde_json::Value>,
    },
    Tool {
        content: ToolContent,
        tool_call_id: String,
        name: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Message::Assistant {
            content,
            tool_calls,
            parsed: None,
        }
    }

    pub fn tool(
        content: impl Into<ToolContent>,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            name: name.into(),
        }
    }

    /// `true` for an assistant message carrying one or more tool calls.
    pub fn has_tool_calls(&self) -> bool {
        matches!(self, Message::Assistant { tool_calls, .. } if !tool_calls.is_empty())
    }

    /// The tool calls on an assistant message, or an empty slice otherwise.
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// `content` if present, else `""` — the Action Loop's documented
    /// boundary behavior for a `stop` finish with empty content.
    pub fn content_or_empty(&self) -> String {
        match self {
            Message::Assistant { content, .. } => content.clone().unwrap_or_default(),
            _ => String::new(),
        }
    }
}

/// `finish_reason` values a [`Choice`] may carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    /// Whether the action/decision loop should keep iterating after seeing
    /// this finish reason.
    pub fn continues_loop(&self) -> bool {
        matches!(self, FinishReason::ToolCalls)
    }
}

/// A single candidate returned by the LLM gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub finish_reason: FinishReason,
    pub index: u32,
    pub message: Message,
}

/// Token accounting for a completion call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The response shape returned by [`crate::cloudllm::llm::LlmGateway::acompletion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub usage: Usage,
}

impl Completion {
    /// The first (and, in this core, only) choice. Panics if `choices` is
    /// empty, which would itself indicate a broken gateway implementation.
    pub fn first_choice(&self) -> &Choice {
        &self.choices[0]
    }
}

/// An ordered sequence of messages, named within a task (e.g. `"root"`,
/// `"writer"`, `"critic_iteration_3"`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Thread {
    pub messages: Vec<Message>,
}

/// A named, structured payload produced by a tool handler and stored in a
/// task's context for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub content: serde_json::Value,
}

/// The single JSON document persisted per task id: every named thread plus
/// a keyed context map. `context["artifacts"]` is reserved for the
/// map-by-name artifact store (see the design notes' resolved open
/// question); callers should go through [`AgentState::artifacts`] rather
/// than poking at `context` directly for that key.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentState {
    #[serde(default)]
    pub threads: HashMap<String, Thread>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

const ARTIFACTS_KEY: &str = "artifacts";

impl AgentState {
    /// Mutable access to the named thread, creating an empty one on first
    /// touch.
    pub fn thread_mut(&mut self, thread_name: &str) -> &mut Thread {
        self.threads.entry(thread_name.to_string()).or_default()
    }

    /// Read-only access to the named thread, if it has been touched before.
    pub fn thread(&self, thread_name: &str) -> Option<&Thread> {
        self.threads.get(thread_name)
    }

    /// The map-by-name artifact store at `context.artifacts`, deserialized
    /// lazily from the raw JSON value.
    pub fn artifacts(&self) -> Result<HashMap<String, Artifact>> {
        match self.context.get(ARTIFACTS_KEY) {
            None => Ok(HashMap::new()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| AgentexError::service(format!("corrupt artifacts map: {}", e))),
        }
    }

    /// Replace the `context.artifacts` map with `artifacts`.
    pub fn set_artifacts(&mut self, artifacts: HashMap<String, Artifact>) {
        self.context
            .insert(ARTIFACTS_KEY.to_string(), serde_json::json!(artifacts));
    }
}

/// Serializes the entire [`AgentState`] to a UTF-8 JSON document under a
/// key equal to the task id. Loading an absent key returns an empty
/// [`AgentState`]; saving is always a whole-object replace (C2).
pub struct AgentStateRepository {
    kv: Arc<dyn KeyValueRepository>,
}

impl AgentStateRepository {
    pub fn new(kv: Arc<dyn KeyValueRepository>) -> Self {
        Self { kv }
    }

    /// Load the state for `task_id`, or an empty state if none has been
    /// saved yet.
    pub async fn load(&self, task_id: &str) -> Result<AgentState> {
        match self.kv.get(task_id).await? {
            None => Ok(AgentState::default()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| AgentexError::service(format!("corrupt agent state: {}", e))),
        }
    }

    /// Persist `state` for `task_id`, replacing whatever was stored before.
    pub async fn save(&self, task_id: &str, state: &AgentState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.kv.set(task_id, raw).await
    }

    /// Delete all state for `task_id`.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.kv.delete(task_id).await
    }
}
