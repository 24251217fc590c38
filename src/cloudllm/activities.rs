//! Activity Library (C6): thin, named adapters executed by the workflow
//! engine. Each public method here corresponds 1:1 to a stable activity
//! name in [`ActivityName`] — that name is part of the wire protocol to the
//! engine (§6) and is also the key under which [`register_all`] installs the
//! activity on a [`LocalEngine`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::cloudllm::actions::{ActionRegistrySet, ReservedContext};
use crate::cloudllm::agent_state_service::AgentStateService;
use crate::cloudllm::engine::{LocalEngine, TypedActivity};
use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::llm::{LlmConfig, LlmGateway};
use crate::cloudllm::notification::{Notification, NotificationGateway, NotificationRequest};
use crate::cloudllm::state::{Artifact, Completion, Message};

/// Root thread name seeded by `BaseWorkflow` and used by `instruct` when the
/// signal payload doesn't name a thread explicitly.
pub const DEFAULT_ROOT_THREAD_NAME: &str = "root";

/// Stable activity names — part of the wire protocol to the workflow engine.
pub struct ActivityName;

impl ActivityName {
    pub const DECIDE_ACTION: &'static str = "decide_action";
    pub const TAKE_ACTION: &'static str = "take_action";
    pub const APPEND_MESSAGES_TO_THREAD: &'static str = "append_messages_to_thread";
    pub const GET_MESSAGES_FROM_THREAD: &'static str = "get_messages_from_thread";
    pub const ADD_ARTIFACT_TO_CONTEXT: &'static str = "add_artifact_to_context";
    pub const SEND_NOTIFICATION: &'static str = "send_notification";
    pub const ASK_LLM: &'static str = "ask_llm";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendMessagesToThreadParams {
    pub task_id: String,
    pub thread_name: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMessagesFromThreadParams {
    pub task_id: String,
    pub thread_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddArtifactToContextParams {
    pub task_id: String,
    pub artifact: Artifact,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideActionParams {
    pub task_id: String,
    pub thread_name: String,
    pub action_registry_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeActionParams {
    pub task_id: String,
    pub thread_name: String,
    pub action_registry_key: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_args: String,
}

/// Shared dependencies behind the activity library: the LLM gateway, the
/// agent-state service, every named action registry, and the notification
/// gateway. One instance is built by the worker host and registered against
/// a [`LocalEngine`] (or any other `WorkflowEngine` binding).
pub struct ActivityLibrary {
    pub llm: Arc<dyn LlmGateway>,
    pub agent_state: Arc<AgentStateService>,
    pub action_registries: ActionRegistrySet,
    pub notifications: Arc<dyn NotificationGateway>,
}

impl ActivityLibrary {
    pub fn new(
        llm: Arc<dyn LlmGateway>,
        agent_state: Arc<AgentStateService>,
        action_registries: ActionRegistrySet,
        notifications: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            llm,
            agent_state,
            action_registries,
            notifications,
        }
    }

    #[instrument(skip(self), fields(task_id = %params.task_id, thread_name = %params.thread_name))]
    pub async fn append_messages_to_thread(
        &self,
        params: AppendMessagesToThreadParams,
    ) -> Result<Vec<Message>> {
        self.agent_state
            .batch_append_messages(&params.task_id, &params.thread_name, params.messages)
            .await
    }

    #[instrument(skip(self), fields(task_id = %params.task_id, thread_name = %params.thread_name))]
    pub async fn get_messages_from_thread(
        &self,
        params: GetMessagesFromThreadParams,
    ) -> Result<Vec<Message>> {
        self.agent_state
            .get_messages(&params.task_id, &params.thread_name)
            .await
    }

    /// Upserts into the canonical map-by-name artifact store (§9 open
    /// question, resolved): both this activity and
    /// `ContextService::set_artifact` funnel through the same
    /// [`AgentStateService::set_artifact`] call, honoring `overwrite`.
    #[instrument(skip(self), fields(task_id = %params.task_id, artifact = %params.artifact.name))]
    pub async fn add_artifact_to_context(&self, params: AddArtifactToContextParams) -> Result<()> {
        self.agent_state
            .set_artifact(&params.task_id, params.artifact, params.overwrite)
            .await
    }

    /// Decide-Action Activity (C6-a). Loads the thread, asks the model, and
    /// — if the model returned tool calls with no explanation — runs a
    /// second completion to back-fill a human-readable `content` before
    /// persisting and returning the assistant turn.
    #[instrument(skip(self), fields(task_id = %params.task_id, thread_name = %params.thread_name, model = %params.model))]
    pub async fn decide_action(&self, params: DecideActionParams) -> Result<Completion> {
        let registry = self.action_registries.get(&params.action_registry_key)?;
        let messages = self
            .agent_state
            .get_messages(&params.task_id, &params.thread_name)
            .await?;

        let config = LlmConfig::new(params.model.clone(), messages.clone())
            .with_tools(registry.function_call_schemas());
        let mut completion = self.llm.acompletion(config).await?;

        let needs_explanation = matches!(
            &completion.choices[0].message,
            Message::Assistant { content: None, tool_calls, .. } if !tool_calls.is_empty()
        );
        if needs_explanation {
            info!("assistant turn has tool calls but no content; backfilling explanation");
            let tool_calls = completion.choices[0].message.tool_calls().to_vec();
            let mut explain_messages = messages;
            explain_messages.push(Message::system(
                "Look at all of the messages above to understand the context of the conversation. \
                 You have already decided to make tool calls, but you haven't provided an explanation \
                 for why you're making them. Please answer the user's question below about the tool \
                 calls you proposed.",
            ));
            explain_messages.push(Message::user(format!(
                "Give me a brief explanation for why you're making the tool calls as you are and how \
                 it will help the user achieve their goal. This message will be sent to the user as a \
                 sort of progress report on your work on the task. These are the tool calls you decided \
                 to make:\n\n{}",
                serde_json::json!(tool_calls),
            )));
            let explanation_config = LlmConfig::new(params.model, explain_messages);
            let explanation = self.llm.acompletion(explanation_config).await?;
            if let Message::Assistant { content, .. } = &mut completion.choices[0].message {
                *content = match &explanation.choices[0].message {
                    Message::Assistant { content, .. } => content.clone(),
                    _ => None,
                };
            }
        }

        self.agent_state
            .append_message(&params.task_id, &params.thread_name, completion.choices[0].message.clone())
            .await?;
        Ok(completion)
    }

    /// Take-Action Activity (C6-b). Always upserts a tool message for
    /// `tool_call_id` — whose content is either the handler's response or
    /// the stringified error — then re-raises on handler failure so the
    /// engine applies its retry policy. A retried attempt with the same
    /// `tool_call_id` replaces the prior attempt's tool message in place
    /// rather than appending a second one (§4.9, §8).
    #[instrument(skip(self), fields(task_id = %params.task_id, tool_name = %params.tool_name, tool_call_id = %params.tool_call_id))]
    pub async fn take_action(
        &self,
        params: TakeActionParams,
    ) -> Result<crate::cloudllm::actions::ActionResponse> {
        let registry = self.action_registries.get(&params.action_registry_key)?;
        let args: serde_json::Value = serde_json::from_str(&params.tool_args)
            .map_err(|e| AgentexError::client(format!("invalid tool arguments JSON: {}", e)))?;

        let ctx = ReservedContext {
            task_id: params.task_id.clone(),
        };
        let outcome = registry.call(&params.tool_name, ctx, args).await;

        let (response, failure) = match outcome {
            Ok(response) => (response, None),
            Err(err) => (
                crate::cloudllm::actions::ActionResponse::failed(err.to_string()),
                Some(err),
            ),
        };

        let tool_message = Message::tool(
            stringify_message_value(&response.message),
            params.tool_call_id.clone(),
            params.tool_name.clone(),
        );
        self.agent_state
            .upsert_tool_message(&params.task_id, &params.thread_name, tool_message)
            .await?;

        if let Some(err) = failure {
            return Err(err);
        }
        Ok(response)
    }

    #[instrument(skip(self, request), fields(topic = %request.topic))]
    pub async fn send_notification(&self, request: NotificationRequest) -> Result<Notification> {
        self.notifications.send(request).await
    }

    #[instrument(skip(self, config), fields(model = %config.model))]
    pub async fn ask_llm(&self, config: LlmConfig) -> Result<Completion> {
        self.llm.acompletion(config).await
    }

    /// Registers every activity in this library against `engine` under its
    /// stable [`ActivityName`].
    pub async fn register_all(self: &Arc<Self>, engine: &LocalEngine) {
        let lib = self.clone();
        engine
            .register(
                ActivityName::APPEND_MESSAGES_TO_THREAD,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.append_messages_to_thread(p).await }
                }),
            )
            .await;

        let lib = self.clone();
        engine
            .register(
                ActivityName::GET_MESSAGES_FROM_THREAD,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.get_messages_from_thread(p).await }
                }),
            )
            .await;

        let lib = self.clone();
        engine
            .register(
                ActivityName::ADD_ARTIFACT_TO_CONTEXT,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.add_artifact_to_context(p).await }
                }),
            )
            .await;

        let lib = self.clone();
        engine
            .register(
                ActivityName::DECIDE_ACTION,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.decide_action(p).await }
                }),
            )
            .await;

        let lib = self.clone();
        engine
            .register(
                ActivityName::TAKE_ACTION,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.take_action(p).await }
                }),
            )
            .await;

        let lib = self.clone();
        engine
            .register(
                ActivityName::SEND_NOTIFICATION,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.send_notification(p).await }
                }),
            )
            .await;

        let lib = self.clone();
        engine
            .register(
                ActivityName::ASK_LLM,
                TypedActivity::new(move |p| {
                    let lib = lib.clone();
                    async move { lib.ask_llm(p).await }
                }),
            )
            .await;
    }
}

/// `str(response.message)` in the source: a JSON string value is rendered
/// bare (no surrounding quotes), matching Python's `str` on a `str`; any
/// other JSON shape is rendered as its JSON text, matching Python's `str` on
/// a `dict`/`list`.
fn stringify_message_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::cloudllm::actions::{ActionHandler, ActionRegistry, ActionResponse};
    use crate::cloudllm::kv::InMemoryKeyValueRepository;
    use crate::cloudllm::llm::ScriptedLlmGateway;
    use crate::cloudllm::notification::InMemoryNotificationGateway;
    use crate::cloudllm::state::{AgentStateRepository, Choice, FinishReason, FunctionCall, ToolCallRequest, Usage};
    use schemars::JsonSchema;
    use serde::Deserialize as SerdeDeserialize;

    fn library(completions: Vec<Completion>) -> Arc<ActivityLibrary> {
        let repo = Arc::new(AgentStateRepository::new(InMemoryKeyValueRepository::shared()));
        let agent_state = Arc::new(AgentStateService::new(repo));
        let llm = Arc::new(ScriptedLlmGateway::new(completions));
        let mut registries = ActionRegistrySet::new();
        registries.insert("writer", ActionRegistry::new());
        Arc::new(ActivityLibrary::new(
            llm,
            agent_state,
            registries,
            Arc::new(InMemoryNotificationGateway::new()),
        ))
    }

    fn stop_completion(content: &str) -> Completion {
        Completion {
            choices: vec![Choice {
                finish_reason: FinishReason::Stop,
                index: 0,
                message: Message::assistant(Some(content.to_string()), vec![]),
            }],
            created: None,
            model: None,
            usage: Usage::default(),
        }
    }

    fn tool_call_completion() -> Completion {
        Completion {
            choices: vec![Choice {
                finish_reason: FinishReason::ToolCalls,
                index: 0,
                message: Message::assistant(
                    None,
                    vec![ToolCallRequest {
                        id: "call_1".to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: "fetch_news".to_string(),
                            arguments: "{}".to_string(),
                        },
                    }],
                ),
            }],
            created: None,
            model: None,
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn decide_action_appends_assistant_message_to_thread() {
        let lib = library(vec![stop_completion("Hi!")]);
        let completion = lib
            .decide_action(DecideActionParams {
                task_id: "t1".to_string(),
                thread_name: "root".to_string(),
                action_registry_key: "writer".to_string(),
                model: "test-model".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(completion.first_choice().finish_reason, FinishReason::Stop);
        let messages = lib
            .agent_state
            .get_messages("t1", "root")
            .await
            .unwrap();
        assert_eq!(messages, vec![Message::assistant(Some("Hi!".to_string()), vec![])]);
    }

    #[tokio::test]
    async fn decide_action_backfills_explanation_when_tool_calls_have_no_content() {
        let lib = library(vec![tool_call_completion(), stop_completion("Fetching news for you.")]);
        let completion = lib
            .decide_action(DecideActionParams {
                task_id: "t1".to_string(),
                thread_name: "root".to_string(),
                action_registry_key: "writer".to_string(),
                model: "test-model".to_string(),
            })
            .await
            .unwrap();
        match &completion.first_choice().message {
            Message::Assistant { content, tool_calls, .. } => {
                assert_eq!(content.as_deref(), Some("Fetching news for you."));
                assert_eq!(tool_calls.len(), 1);
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[derive(Debug, SerdeDeserialize, JsonSchema)]
    struct FetchNewsParams {
        /// Search keyword.
        keyword: String,
    }

    struct FetchNewsHandler;

    #[async_trait]
    impl ActionHandler<FetchNewsParams> for FetchNewsHandler {
        fn description(&self) -> &str {
            "Fetch news headlines."
        }
        async fn handle(&self, _ctx: ReservedContext, params: FetchNewsParams) -> Result<ActionResponse> {
            Ok(ActionResponse::ok(serde_json::json!({"headline": format!("{} news", params.keyword)})))
        }
    }

    struct FailingHandler;

    #[derive(Debug, SerdeDeserialize, JsonSchema)]
    struct NoParams {}

    #[async_trait]
    impl ActionHandler<NoParams> for FailingHandler {
        fn description(&self) -> &str {
            "Always fails."
        }
        async fn handle(&self, _ctx: ReservedContext, _params: NoParams) -> Result<ActionResponse> {
            Err(AgentexError::transient(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
        }
    }

    #[tokio::test]
    async fn take_action_appends_tool_message_on_success() {
        let lib = library(vec![]);
        let mut registry = ActionRegistry::new();
        registry.register("fetch_news", FetchNewsHandler).unwrap();
        let mut registries = ActionRegistrySet::new();
        registries.insert("writer", registry);
        let lib = Arc::new(ActivityLibrary::new(
            lib.llm.clone(),
            lib.agent_state.clone(),
            registries,
            Arc::new(InMemoryNotificationGateway::new()),
        ));

        lib.take_action(TakeActionParams {
            task_id: "t1".to_string(),
            thread_name: "root".to_string(),
            action_registry_key: "writer".to_string(),
            tool_call_id: "call_1".to_string(),
            tool_name: "fetch_news".to_string(),
            tool_args: "{\"keyword\":\"AI\"}".to_string(),
        })
        .await
        .unwrap();

        let messages = lib.agent_state.get_messages("t1", "root").await.unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Tool { tool_call_id, name, .. } => {
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(name, "fetch_news");
            }
            _ => panic!("expected tool message"),
        }
    }

    #[tokio::test]
    async fn take_action_appends_error_tool_message_and_reraises_on_failure() {
        let lib = library(vec![]);
        let mut registry = ActionRegistry::new();
        registry.register("always_fails", FailingHandler).unwrap();
        let mut registries = ActionRegistrySet::new();
        registries.insert("writer", registry);
        let lib = Arc::new(ActivityLibrary::new(
            lib.llm.clone(),
            lib.agent_state.clone(),
            registries,
            Arc::new(InMemoryNotificationGateway::new()),
        ));

        let err = lib
            .take_action(TakeActionParams {
                task_id: "t1".to_string(),
                thread_name: "root".to_string(),
                action_registry_key: "writer".to_string(),
                tool_call_id: "call_1".to_string(),
                tool_name: "always_fails".to_string(),
                tool_args: "{}".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let messages = lib.agent_state.get_messages("t1", "root").await.unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Message::Tool { content, .. } => {
                assert!(content.to_string().contains("boom"));
            }
            _ => panic!("expected tool message"),
        }
    }

    #[tokio::test]
    async fn add_artifact_to_context_upserts_into_map_store() {
        let lib = library(vec![]);
        lib.add_artifact_to_context(AddArtifactToContextParams {
            task_id: "t1".to_string(),
            artifact: Artifact {
                name: "report".to_string(),
                description: None,
                content: serde_json::json!({"ok": true}),
            },
            overwrite: false,
        })
        .await
        .unwrap();
        let artifacts = lib.agent_state.get_artifacts("t1").await.unwrap();
        assert!(artifacts.contains_key("report"));
    }

    #[tokio::test]
    async fn register_all_wires_every_activity_name_into_engine() {
        let lib = library(vec![stop_completion("hi")]);
        let engine = LocalEngine::new();
        lib.register_all(&engine).await;

        let result = engine
            .execute_activity(
                ActivityName::APPEND_MESSAGES_TO_THREAD,
                serde_json::to_value(AppendMessagesToThreadParams {
                    task_id: "t1".to_string(),
                    thread_name: "root".to_string(),
                    messages: vec![Message::user("hi")],
                })
                .unwrap(),
                crate::cloudllm::engine::ActivityOptions::default_floor(),
            )
            .await;
        assert!(result.is_ok());
    }
}
