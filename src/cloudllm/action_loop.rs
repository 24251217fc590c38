//! Action/Decision Loop (C8): alternates `decide_action` and a parallel
//! `take_action` fan-out until the model returns a non-tool finish reason.
//!
//! This is workflow-plane code: every suspension point is
//! `engine.execute_activity`, so the loop is replay-safe — its branching and
//! iteration count derive only from activity results the engine can replay
//! identically.

use std::sync::Arc;
use tracing::info;

use crate::cloudllm::activities::{ActivityName, DecideActionParams, TakeActionParams};
use crate::cloudllm::engine::{ActivityOptions, WorkflowEngine};
use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::state::FinishReason;

/// A single structured event recorded in `BaseWorkflow::event_log` as the
/// loop progresses. Kept loosely typed (`serde_json::Value` payload) to
/// match the source's free-form `{"event": ..., **payload}` dict shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoopEvent {
    pub event: &'static str,
    #[serde(flatten)]
    pub payload: serde_json::Value,
}

/// Safety ceiling on loop iterations. Not part of the source contract — the
/// source trusts the model's finish reasons unconditionally — but a
/// misbehaving model that never stops calling tools would otherwise wedge a
/// host process forever.
pub const DEFAULT_MAX_ITERATIONS: u32 = 256;

pub struct ActionLoop {
    pub max_iterations: u32,
}

impl Default for ActionLoop {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl ActionLoop {
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }

    /// Runs the loop for `(task_id, thread_name)` against `action_registry_key`
    /// and `model`, appending a [`LoopEvent`] to `event_log` at each
    /// significant transition and returning the final assistant `content`.
    pub async fn run(
        &self,
        engine: &Arc<dyn WorkflowEngine>,
        event_log: &mut Vec<LoopEvent>,
        task_id: &str,
        thread_name: &str,
        action_registry_key: &str,
        model: &str,
    ) -> Result<String> {
        let mut content = String::new();
        let mut iterations: u32 = 0;

        loop {
            iterations += 1;
            if iterations > self.max_iterations {
                return Err(AgentexError::service(format!(
                    "action loop exceeded {} iterations without a terminal finish reason",
                    self.max_iterations
                )));
            }

            let decide_params = DecideActionParams {
                task_id: task_id.to_string(),
                thread_name: thread_name.to_string(),
                action_registry_key: action_registry_key.to_string(),
                model: model.to_string(),
            };
            let raw = engine
                .execute_activity(
                    ActivityName::DECIDE_ACTION,
                    serde_json::to_value(&decide_params)?,
                    ActivityOptions::caller_default(),
                )
                .await?;
            let completion: crate::cloudllm::state::Completion = serde_json::from_value(raw)
                .map_err(|e| AgentexError::service(format!("decide_action response coercion failed: {}", e)))?;

            event_log.push(LoopEvent {
                event: "decision_made",
                payload: serde_json::json!({"completion": completion}),
            });

            let choice = completion.first_choice();
            let finish_reason = choice.finish_reason;
            content = choice.message.content_or_empty();
            let tool_calls = choice.message.tool_calls().to_vec();

            if !tool_calls.is_empty() {
                info!(count = tool_calls.len(), "executing tool calls");
                event_log.push(LoopEvent {
                    event: "executing_tool_calls",
                    payload: serde_json::json!({}),
                });

                let mut futures = Vec::with_capacity(tool_calls.len());
                for tool_call in &tool_calls {
                    event_log.push(LoopEvent {
                        event: "executing_tool_call",
                        payload: serde_json::json!({"tool_call_id": tool_call.id, "tool_name": tool_call.function.name}),
                    });
                    let take_params = TakeActionParams {
                        task_id: task_id.to_string(),
                        thread_name: thread_name.to_string(),
                        action_registry_key: action_registry_key.to_string(),
                        tool_call_id: tool_call.id.clone(),
                        tool_name: tool_call.function.name.clone(),
                        tool_args: tool_call.function.arguments.clone(),
                    };
                    let engine = engine.clone();
                    futures.push(async move {
                        engine
                            .execute_activity(
                                ActivityName::TAKE_ACTION,
                                serde_json::to_value(&take_params)?,
                                ActivityOptions::caller_default(),
                            )
                            .await
                    });
                }
                // All-or-error barrier: fan out concurrently, then await
                // every result before the next decision (§5).
                let results = futures_util::future::join_all(futures).await;
                for result in results {
                    result?;
                }
            }

            if !finish_reason.continues_loop() {
                return Ok(content);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::actions::{ActionHandler, ActionRegistry, ActionResponse, ReservedContext};
    use crate::cloudllm::activities::ActivityLibrary;
    use crate::cloudllm::agent_state_service::AgentStateService;
    use crate::cloudllm::engine::LocalEngine;
    use crate::cloudllm::kv::InMemoryKeyValueRepository;
    use crate::cloudllm::llm::ScriptedLlmGateway;
    use crate::cloudllm::notification::InMemoryNotificationGateway;
    use crate::cloudllm::state::{
        AgentStateRepository, Choice, Completion, FinishReason, FunctionCall, Message, ToolCallRequest, Usage,
    };
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;

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

    fn tool_calls_completion(calls: Vec<ToolCallRequest>) -> Completion {
        Completion {
            choices: vec![Choice {
                finish_reason: FinishReason::ToolCalls,
                index: 0,
                message: Message::assistant(None, calls),
            }],
            created: None,
            model: None,
            usage: Usage::default(),
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct NewsParams {
        /// Search keyword.
        keyword: String,
    }
    struct NewsHandler;
    #[async_trait]
    impl ActionHandler<NewsParams> for NewsHandler {
        fn description(&self) -> &str {
            "fetch news"
        }
        async fn handle(&self, _ctx: ReservedContext, params: NewsParams) -> crate::cloudllm::errors::Result<ActionResponse> {
            Ok(ActionResponse::ok(serde_json::json!({"headline": params.keyword})))
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct SummaryParams {
        /// Artifact name.
        name: String,
        /// Artifact description.
        description: String,
        /// Markdown content.
        markdown_content: String,
    }
    struct SummaryHandler;
    #[async_trait]
    impl ActionHandler<SummaryParams> for SummaryHandler {
        fn description(&self) -> &str {
            "write a summary"
        }
        async fn handle(&self, _ctx: ReservedContext, params: SummaryParams) -> crate::cloudllm::errors::Result<ActionResponse> {
            Ok(ActionResponse::ok(serde_json::json!({"wrote": params.name, "description": params.description, "content": params.markdown_content})))
        }
    }

    async fn setup(completions: Vec<Completion>) -> (Arc<dyn WorkflowEngine>, Arc<ActivityLibrary>) {
        let repo = Arc::new(AgentStateRepository::new(InMemoryKeyValueRepository::shared()));
        let agent_state = Arc::new(AgentStateService::new(repo));
        let llm = Arc::new(ScriptedLlmGateway::new(completions));
        let mut registry = ActionRegistry::new();
        registry.register("fetch_news", NewsHandler).unwrap();
        registry.register("write_summary", SummaryHandler).unwrap();
        let mut registries = crate::cloudllm::actions::ActionRegistrySet::new();
        registries.insert("root", registry);
        let library = Arc::new(ActivityLibrary::new(
            llm,
            agent_state,
            registries,
            Arc::new(InMemoryNotificationGateway::new()),
        ));
        let engine = Arc::new(LocalEngine::new());
        library.register_all(&engine).await;
        (engine as Arc<dyn WorkflowEngine>, library)
    }

    #[tokio::test]
    async fn single_shot_no_tools_returns_content_immediately() {
        let (engine, library) = setup(vec![stop_completion("Hi!")]).await;
        library
            .agent_state
            .batch_append_messages(
                "t1",
                "root",
                vec![Message::system("be helpful"), Message::user("Say hi")],
            )
            .await
            .unwrap();

        let mut log = Vec::new();
        let content = ActionLoop::default()
            .run(&engine, &mut log, "t1", "root", "root", "test-model")
            .await
            .unwrap();
        assert_eq!(content, "Hi!");

        let messages = library.agent_state.get_messages("t1", "root").await.unwrap();
        assert_eq!(
            messages,
            vec![
                Message::system("be helpful"),
                Message::user("Say hi"),
                Message::assistant(Some("Hi!".to_string()), vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn two_tool_calls_run_and_second_turn_stops() {
        let calls = vec![
            ToolCallRequest {
                id: "a".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "fetch_news".to_string(),
                    arguments: "{\"keyword\":\"AI\"}".to_string(),
                },
            },
            ToolCallRequest {
                id: "b".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "write_summary".to_string(),
                    arguments: "{\"name\":\"n\",\"description\":\"d\",\"markdown_content\":\"#h\"}".to_string(),
                },
            },
        ];
        let (engine, library) = setup(vec![
            Completion {
                choices: vec![Choice {
                    finish_reason: FinishReason::ToolCalls,
                    index: 0,
                    message: Message::assistant(Some("Working on it.".to_string()), calls),
                }],
                created: None,
                model: None,
                usage: Usage::default(),
            },
            stop_completion("Done!"),
        ])
        .await;

        let mut log = Vec::new();
        let content = ActionLoop::default()
            .run(&engine, &mut log, "t1", "root", "root", "test-model")
            .await
            .unwrap();
        assert_eq!(content, "Done!");

        let messages = library.agent_state.get_messages("t1", "root").await.unwrap();
        let tool_call_ids: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                Message::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tool_call_ids.len(), 2);
        assert!(tool_call_ids.contains(&"a"));
        assert!(tool_call_ids.contains(&"b"));
    }

    #[tokio::test]
    async fn backfilled_tool_call_turn_has_nonempty_content_when_persisted() {
        let calls = vec![tool_calls_completion(vec![ToolCallRequest {
            id: "a".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "fetch_news".to_string(),
                arguments: "{\"keyword\":\"AI\"}".to_string(),
            },
        }])];
        let mut completions = calls;
        completions.push(stop_completion("Explaining the tool call."));
        completions.push(stop_completion("Done!"));
        let (engine, library) = setup(completions).await;

        let mut log = Vec::new();
        ActionLoop::default()
            .run(&engine, &mut log, "t1", "root", "root", "test-model")
            .await
            .unwrap();

        let messages = library.agent_state.get_messages("t1", "root").await.unwrap();
        let assistant_with_tools = messages
            .iter()
            .find(|m| m.has_tool_calls())
            .expect("assistant turn with tool calls");
        match assistant_with_tools {
            Message::Assistant { content, .. } => assert!(content.as_deref().unwrap_or("").len() > 0),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn loop_iteration_ceiling_raises_service_error() {
        let mut completions = Vec::new();
        for _ in 0..5 {
            completions.push(tool_calls_completion(vec![ToolCallRequest {
                id: "a".to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: "fetch_news".to_string(),
                    arguments: "{\"keyword\":\"AI\"}".to_string(),
                },
            }]));
            completions.push(stop_completion("explain"));
        }
        let (engine, _library) = setup(completions).await;
        let mut log = Vec::new();
        let err = ActionLoop::new(2)
            .run(&engine, &mut log, "t1", "root", "root", "test-model")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentexError::Service(_)));
    }
}
