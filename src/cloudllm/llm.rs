//! LLM Gateway port (C5).
//!
//! The concrete vendor binding (OpenAI, Anthropic, ...) is an external
//! collaborator; this module defines the [`LlmGateway`] trait the rest of
//! the core programs against, plus [`ScriptedLlmGateway`], a deterministic
//! in-memory double used by this crate's own tests and as a template for a
//! production binding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::state::{Completion, Message};

/// Request shape for a single completion call. Field set mirrors the
/// OpenAI-style chat-completions surface the source threads through
/// unmodified to the vendor API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub response_format: Option<serde_json::Value>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub tool_choice: Option<String>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub logprobs: Option<bool>,
    #[serde(default)]
    pub top_logprobs: Option<u32>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl LlmConfig {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            response_format: None,
            seed: None,
            tool_choice: None,
            parallel_tool_calls: None,
            logprobs: None,
            top_logprobs: None,
            n: None,
            stream: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Async completion port. Backend errors surface as raised errors; there is
/// no silent empty-completion fallback.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn acompletion(&self, config: LlmConfig) -> Result<Completion>;
}

/// A deterministic, scripted [`LlmGateway`] double: each call to
/// `acompletion` pops the next queued [`Completion`] in FIFO order. Used by
/// this crate's own activity and workflow tests so the decision loop's
/// control flow can be exercised without a real vendor dependency.
pub struct ScriptedLlmGateway {
    script: Mutex<std::collections::VecDeque<Completion>>,
    calls: AtomicUsize,
}

impl ScriptedLlmGateway {
    pub fn new(completions: Vec<Completion>) -> Self {
        Self {
            script: Mutex::new(completions.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls_made(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmGateway for ScriptedLlmGateway {
    async fn acompletion(&self, _config: LlmConfig) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().await;
        script
            .pop_front()
            .ok_or_else(|| AgentexError::service("scripted LLM gateway ran out of completions"))
    }
}
