// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access.
pub use cloudllm::action_loop::{ActionLoop, LoopEvent};
pub use cloudllm::actions::{ActionHandler, ActionRegistry, ActionRegistrySet, ActionResponse, ReservedContext};
pub use cloudllm::activities::{ActivityLibrary, ActivityName};
pub use cloudllm::agent_state_service::AgentStateService;
pub use cloudllm::config::WorkerConfig;
pub use cloudllm::engine::{ActivityOptions, LocalEngine, RetryPolicy, WorkflowEngine};
pub use cloudllm::errors::{AgentexError, Result};
pub use cloudllm::kv::{InMemoryKeyValueRepository, KeyValueRepository};
pub use cloudllm::llm::{LlmConfig, LlmGateway};
pub use cloudllm::notification::{Notification, NotificationGateway, NotificationRequest};
pub use cloudllm::state::{AgentState, AgentStateRepository, Completion, Message, Thread};
pub use cloudllm::task::{Agent, Task, TaskStatus};
pub use cloudllm::workflow::{AgentTaskWorkflow, AgentTaskWorkflowParams, BaseWorkflow, HumanInstruction};
