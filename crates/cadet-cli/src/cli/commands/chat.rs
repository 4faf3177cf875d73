//! Chat command handler: assembles tools, backend and session, then runs the REPL.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cadet_core::config::Config;
use cadet_core::core::checkpoint::SqliteCheckpointStore;
use cadet_core::core::graph::{DEFAULT_SYSTEM_PROMPT, ExecutionGraph};
use cadet_core::core::session::Session;
use cadet_core::core::startup::Credentials;
use cadet_core::core::steering::KeywordSteering;
use cadet_core::providers::{GeminiClient, GeminiConfig};
use cadet_core::tools::local::LocalContext;
use cadet_core::tools::mcp::{self, McpSession};
use cadet_core::tools::{ToolRegistry, github, local};
use tracing::{info, warn};

use crate::modes;

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub root: PathBuf,
    pub thread_id: Option<String>,
    pub model: Option<String>,
    pub max_steps: Option<usize>,
    pub no_mcp: bool,
}

pub async fn run(opts: ChatOptions, mut config: Config) -> Result<()> {
    // Fatal before anything else starts.
    let credentials = Credentials::from_env()?;

    if let Some(model) = opts.model {
        config.model = model;
    }
    if let Some(max_steps) = opts.max_steps {
        config.max_steps = max_steps;
    }
    let root = opts
        .root
        .canonicalize()
        .with_context(|| format!("resolve root {}", opts.root.display()))?;
    let thread_id = opts
        .thread_id
        .unwrap_or_else(|| config.thread_id.clone());

    let (registry, mcp_session) = build_registry(&config, &credentials, &root, opts.no_mcp).await?;
    info!(
        tools = registry.len(),
        thread_id, model = %config.model, "starting chat"
    );

    let backend = GeminiClient::new(GeminiConfig::from_config(
        &config,
        credentials.model_api_key.clone(),
    )?)?;
    let graph = ExecutionGraph::new(backend, Arc::new(registry))
        .with_steering(KeywordSteering::new(&config.steering_keywords))
        .with_system_prompt(config.system_prompt_override().unwrap_or(DEFAULT_SYSTEM_PROMPT))
        .with_max_steps(config.max_steps)
        .with_tool_timeout(config.tool_timeout());

    let checkpoint_path = config.checkpoint_path();
    let store = SqliteCheckpointStore::open(&checkpoint_path)
        .with_context(|| format!("open checkpoints at {}", checkpoint_path.display()))?;
    let session = Session::open(thread_id, graph, Box::new(store)).context("resume session")?;

    let result = modes::repl::run(session).await;

    if let Some(mcp_session) = mcp_session {
        mcp_session.shutdown().await;
    }
    result
}

/// Local tools always; GitHub and MCP tools only with a token.
async fn build_registry(
    config: &Config,
    credentials: &Credentials,
    root: &Path,
    no_mcp: bool,
) -> Result<(ToolRegistry, Option<McpSession>)> {
    let mut registry = ToolRegistry::new();

    let mut local_ctx = LocalContext::new(root, config.test_command.clone());
    if let Some(timeout) = config.tool_timeout() {
        local_ctx = local_ctx.with_test_timeout(timeout);
    }
    registry
        .register(local::handles(local_ctx))
        .context("register local tools")?;

    let Some(token) = credentials.github_token.as_deref() else {
        return Ok((registry, None));
    };

    let client = github::GithubClient::from_config(config, token, root)
        .context("configure GitHub client")?;
    registry
        .register(github::handles(client))
        .context("register GitHub tools")?;

    if no_mcp || !config.mcp.enabled {
        info!("MCP discovery disabled");
        return Ok((registry, None));
    }

    eprintln!("Discovering MCP tools ({})...", config.mcp.command);
    match mcp::discover(&config.mcp, token, mcp::DISCOVERY_TIMEOUT).await {
        Ok(session) => {
            let added = registry.register_lenient(session.handles());
            eprintln!("Loaded {added} MCP tools");
            Ok((registry, Some(session)))
        }
        Err(err) => {
            warn!("MCP discovery failed: {err}");
            eprintln!("Warning: MCP tools unavailable: {err}");
            Ok((registry, None))
        }
    }
}
