//! Worker Host (C10): the process that binds an [`agentex::WorkflowEngine`]
//! and an [`agentex::ActivityLibrary`] together on a named task queue and
//! serves a `/readyz` health probe, ready for a control plane (out of scope
//! per §1/§6) to start [`agentex::AgentTaskWorkflow`] instances against it.
//!
//! Grounded in the source's `AgentexWorker`: health-check server up first,
//! `healthy` flips to `true` once the engine + activities are wired, and the
//! process keeps running for as long as the task queue has work. This
//! binding uses [`agentex::LocalEngine`] in place of a Temporal client —
//! see [`agentex::cloudllm::engine`] for why.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agentex::cloudllm::actions::ActionRegistrySet;
use agentex::cloudllm::activities::ActivityLibrary;
use agentex::cloudllm::agent_state_service::AgentStateService;
use agentex::cloudllm::config::WorkerConfig;
use agentex::cloudllm::engine::LocalEngine;
use agentex::cloudllm::kv::InMemoryKeyValueRepository;
use agentex::cloudllm::llm::LlmGateway;
use agentex::cloudllm::notification::NotificationGateway;
use agentex::cloudllm::state::AgentStateRepository;
use agentex::{AgentexError, Result};

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Shared readiness flag the health route reads and `main` flips once the
/// engine + activity library are fully wired, mirroring the source's eager
/// `healthy = true` right before `worker.run()`.
#[derive(Clone, Default)]
struct Health {
    ready: Arc<AtomicBool>,
}

async fn readyz(State(health): State<Health>) -> Json<bool> {
    Json(health.ready.load(Ordering::SeqCst))
}

fn init_tracing(directives: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Constructs the stock LLM gateway + notification gateway bindings this
/// reference host ships with. A real deployment swaps these two for crates
/// that actually talk to a vendor and a push-notification backend; every
/// other component here is unaffected by that swap.
fn build_external_collaborators() -> (Arc<dyn LlmGateway>, Arc<dyn NotificationGateway>) {
    (
        Arc::new(agentex::cloudllm::llm::ScriptedLlmGateway::new(Vec::new())),
        Arc::new(agentex::cloudllm::notification::InMemoryNotificationGateway::new()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::load();
    init_tracing(&config.rust_log);

    info!(task_queue = %config.task_queue, env = ?config.env, "starting agentex worker");

    let health = Health::default();
    let app = Router::new()
        .route("/readyz", get(readyz))
        .with_state(health.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.health_port))
        .await
        .map_err(|e| AgentexError::service(format!("failed to bind health port: {}", e)))?;
    info!(port = config.health_port, "health check server listening on /readyz");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "health check server exited");
        }
    });

    let repository = Arc::new(AgentStateRepository::new(InMemoryKeyValueRepository::shared()));
    let agent_state = Arc::new(AgentStateService::new(repository));
    let (llm, notifications) = build_external_collaborators();
    let registries = ActionRegistrySet::new();
    let activity_library = Arc::new(ActivityLibrary::new(llm, agent_state, registries, notifications));

    let engine = LocalEngine::shared();
    activity_library.register_all(&engine).await;

    health.ready.store(true, Ordering::SeqCst);
    info!("worker ready; awaiting shutdown signal");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AgentexError::service(format!("failed to listen for shutdown signal: {}", e)))?;
    info!("shutdown signal received, exiting");
    Ok(())
}
