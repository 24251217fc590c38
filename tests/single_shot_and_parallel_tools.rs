//! End-to-end coverage for SPEC_FULL.md §8 scenarios 1 and 2, driven through
//! the public `AgentTaskWorkflow` rather than the lower-level `ActionLoop`
//! unit tests colocated in `action_loop.rs`.

use std::sync::Arc;

use agentex::cloudllm::actions::{ActionHandler, ActionRegistry, ActionRegistrySet, ActionResponse, ReservedContext};
use agentex::cloudllm::activities::ActivityLibrary;
use agentex::cloudllm::agent_state_service::AgentStateService;
use agentex::cloudllm::engine::LocalEngine;
use agentex::cloudllm::kv::InMemoryKeyValueRepository;
use agentex::cloudllm::llm::ScriptedLlmGateway;
use agentex::cloudllm::notification::InMemoryNotificationGateway;
use agentex::cloudllm::state::{
    AgentStateRepository, Choice, Completion, FinishReason, FunctionCall, Message, ToolCallRequest, Usage,
};
use agentex::cloudllm::workflow::CancellationToken;
use agentex::{AgentTaskWorkflow, AgentTaskWorkflowParams, Task, WorkflowEngine};
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
    async fn handle(&self, _ctx: ReservedContext, params: NewsParams) -> agentex::Result<ActionResponse> {
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
    async fn handle(&self, _ctx: ReservedContext, params: SummaryParams) -> agentex::Result<ActionResponse> {
        Ok(ActionResponse::ok(serde_json::json!({
            "wrote": params.name,
            "description": params.description,
            "content": params.markdown_content,
        })))
    }
}

async fn workflow(
    completions: Vec<Completion>,
) -> (AgentTaskWorkflow, Arc<ActivityLibrary>, Arc<InMemoryNotificationGateway>) {
    let repo = Arc::new(AgentStateRepository::new(InMemoryKeyValueRepository::shared()));
    let agent_state = Arc::new(AgentStateService::new(repo));
    let llm = Arc::new(ScriptedLlmGateway::new(completions));
    let mut registry = ActionRegistry::new();
    registry.register("fetch_news", NewsHandler).unwrap();
    registry.register("write_summary", SummaryHandler).unwrap();
    let mut registries = ActionRegistrySet::new();
    registries.insert("root", registry);
    let notifications = Arc::new(InMemoryNotificationGateway::new());
    let library = Arc::new(ActivityLibrary::new(llm, agent_state, registries, notifications.clone()));
    let engine = Arc::new(LocalEngine::new());
    library.register_all(&engine).await;
    let workflow = AgentTaskWorkflow::new(
        "News Agent",
        "be helpful",
        "test-model",
        "root",
        "task-topic",
        engine as Arc<dyn WorkflowEngine>,
    );
    (workflow, library, notifications)
}

#[tokio::test]
async fn single_shot_no_tools_returns_completed_with_expected_thread_and_notification() {
    let (workflow, library, notifications) = workflow(vec![stop_completion("Hi!")]).await;
    let task = Task::new("t1", "agent-1", "Say hi");
    let cancel = CancellationToken::new();

    let status = workflow
        .run(AgentTaskWorkflowParams { task, require_approval: false }, &cancel)
        .await
        .unwrap();
    assert_eq!(status, "completed");

    let messages = library.agent_state.get_messages("t1", "root").await.unwrap();
    assert_eq!(
        messages,
        vec![
            Message::system("be helpful"),
            Message::user("Say hi"),
            Message::assistant(Some("Hi!".to_string()), vec![]),
        ]
    );

    let sent = notifications.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].message.contains("Hi!"));
}

#[tokio::test]
async fn two_parallel_tool_calls_both_land_before_second_decision_stops() {
    let calls = vec![
        ToolCallRequest {
            id: "a".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall { name: "fetch_news".to_string(), arguments: "{\"keyword\":\"AI\"}".to_string() },
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
    let first_turn = Completion {
        choices: vec![Choice {
            finish_reason: FinishReason::ToolCalls,
            index: 0,
            // Empty content exercises the decide_action explanation back-fill (§4.8).
            message: Message::assistant(None, calls),
        }],
        created: None,
        model: None,
        usage: Usage::default(),
    };
    let (workflow, library, _notifications) = workflow(vec![
        first_turn,
        stop_completion("Explaining the tool calls."),
        stop_completion("Done!"),
    ])
    .await;
    let task = Task::new("t1", "agent-1", "Summarize the AI news");
    let cancel = CancellationToken::new();

    let status = workflow
        .run(AgentTaskWorkflowParams { task, require_approval: false }, &cancel)
        .await
        .unwrap();
    assert_eq!(status, "completed");

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

    let assistant_with_tools = messages.iter().find(|m| m.has_tool_calls()).unwrap();
    match assistant_with_tools {
        Message::Assistant { content, .. } => assert!(content.as_deref().unwrap_or("").len() > 0),
        _ => unreachable!(),
    }
}
