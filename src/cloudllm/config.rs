//! Worker configuration (A3).
//!
//! [`WorkerConfig`] is the one place environment variables are read: every
//! other module takes its dependencies as constructor arguments, so
//! swapping a real deployment's Redis/Temporal/health-port wiring for an
//! in-process test double never requires touching anything but the binary
//! entry point (see [`crate::cloudllm::engine`], [`bin/worker`](../../../bin/worker.rs)).
//!
//! Field names and defaults follow the source's `EnvironmentVariables`
//! model; `RUST_LOG`, `AGENTEX_TASK_QUEUE` and `AGENTEX_HEALTH_PORT` are
//! supplemented for the ambient logging/worker-host concerns the source
//! handles elsewhere (uvicorn flags, a separate logging config module).

use clap::Parser;

/// Deployment environment, mirroring the source's `Environment` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

/// Worker process configuration, read once at startup from the environment
/// (with CLI flags able to override, via `clap`'s `env` feature).
#[derive(Debug, Clone, Parser)]
#[command(name = "agentex-worker", about = "Durable agent task worker host")]
pub struct WorkerConfig {
    /// `ENV` — selects `.env` loading behavior; has no runtime effect beyond
    /// that in this crate, since config loading is explicit rather than
    /// implicit dotenv-based.
    #[arg(long, env = "ENV", value_enum, default_value = "development")]
    pub env: Environment,

    /// `TEMPORAL_ADDRESS` — address of a durable-execution engine's
    /// frontend, when one is bound in place of [`crate::cloudllm::engine::LocalEngine`].
    #[arg(long, env = "TEMPORAL_ADDRESS")]
    pub temporal_address: Option<String>,

    /// `REDIS_URL` — address of a [`crate::cloudllm::kv::KeyValueRepository`]
    /// backend, when one is bound in place of `InMemoryKeyValueRepository`.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Base URL of the task/agent control plane (out of scope per §1, but
    /// the worker needs it to report task status transitions back).
    #[arg(long, env = "AGENTEX_BASE_URL")]
    pub agentex_base_url: Option<String>,

    /// `tracing_subscriber::EnvFilter` directive string.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub rust_log: String,

    /// Task queue name this worker polls / is addressed by.
    #[arg(long, env = "AGENTEX_TASK_QUEUE", default_value = "agentex")]
    pub task_queue: String,

    /// Port the `/readyz` health probe binds to. Defaults to 80 per §6.
    #[arg(long, env = "AGENTEX_HEALTH_PORT", default_value_t = 80)]
    pub health_port: u16,
}

impl WorkerConfig {
    /// Parse configuration from process arguments and environment
    /// variables, applying defaults for anything unset.
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn is_development(&self) -> bool {
        matches!(self.env, Environment::Development)
    }
}
