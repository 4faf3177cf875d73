//! Tools discovered from an MCP server running as a subprocess.
//!
//! Discovery spawns the configured command, completes the handshake and lists
//! every tool the server offers. Each tool becomes an async [`ToolHandle`]
//! that forwards to `tools/call` on the same connection. The connection lives
//! in [`McpSession`] until [`McpSession::shutdown`].

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent, Tool};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Provenance, ToolDefinition, ToolHandle};
use crate::config::McpConfig;

/// Covers `npx` fetching the server package on first use.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(90);

/// Schema keys Gemini rejects in function declarations.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 2] = ["$schema", "additionalProperties"];

/// Why the discovered source contributed nothing. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum ToolDiscoveryError {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake with '{command}' failed: {message}")]
    Handshake { command: String, message: String },
    #[error("listing tools failed: {0}")]
    ListTools(String),
    #[error("tool discovery timed out after {0} seconds")]
    TimedOut(u64),
}

/// A live server connection plus the handles bound to it.
pub struct McpSession {
    service: RunningService<RoleClient, ()>,
    handles: Vec<ToolHandle>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("tools", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl McpSession {
    pub fn handles(&self) -> Vec<ToolHandle> {
        self.handles.clone()
    }

    /// Closes the connection and lets the subprocess exit.
    pub async fn shutdown(self) {
        match self.service.cancel().await {
            Ok(reason) => debug!(?reason, "MCP session closed"),
            Err(err) => warn!("MCP session did not shut down cleanly: {err}"),
        }
    }
}

/// Spawns the server described by `config` and lists its tools.
///
/// # Errors
/// Returns a [`ToolDiscoveryError`] if the server cannot be started, the
/// handshake fails, or listing does not finish within `timeout`.
pub async fn discover(
    config: &McpConfig,
    github_token: &str,
    timeout: Duration,
) -> Result<McpSession, ToolDiscoveryError> {
    match tokio::time::timeout(timeout, connect(config, github_token)).await {
        Ok(result) => result,
        Err(_) => Err(ToolDiscoveryError::TimedOut(timeout.as_secs())),
    }
}

async fn connect(config: &McpConfig, github_token: &str) -> Result<McpSession, ToolDiscoveryError> {
    let display = std::iter::once(config.command.as_str())
        .chain(config.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .env("GITHUB_TOKEN", github_token)
        .env("GITHUB_PERSONAL_ACCESS_TOKEN", github_token);

    let (transport, stderr) = TokioChildProcess::builder(cmd)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ToolDiscoveryError::Spawn {
            command: display.clone(),
            source,
        })?;

    // The server's banner and progress output go to the log, not the terminal.
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "cadet::mcp_server", "{line}");
            }
        });
    }

    let service = ().serve(transport).await.map_err(|e| ToolDiscoveryError::Handshake {
        command: display.clone(),
        message: e.to_string(),
    })?;

    let tools = match service.peer().list_all_tools().await {
        Ok(tools) => tools,
        Err(err) => {
            let _ = service.cancel().await;
            return Err(ToolDiscoveryError::ListTools(err.to_string()));
        }
    };

    let peer = service.peer().clone();
    let handles: Vec<ToolHandle> = tools
        .into_iter()
        .map(|tool| to_handle(peer.clone(), tool))
        .collect();
    let command = &display;
    info!(command = %command, tools = handles.len(), "discovered MCP tools");

    Ok(McpSession { service, handles })
}

fn to_handle(peer: Peer<RoleClient>, tool: Tool) -> ToolHandle {
    let name = tool.name.to_string();
    let definition = ToolDefinition::new(
        name.clone(),
        tool.description.map(|d| d.to_string()).unwrap_or_default(),
        clean_schema(Value::Object((*tool.input_schema).clone())),
    );

    ToolHandle::asynchronous(definition, Provenance::Discovered, move |args| {
        let peer = peer.clone();
        let name = name.clone();
        async move { call(&peer, name, args).await }
    })
}

async fn call(peer: &Peer<RoleClient>, name: String, args: Value) -> anyhow::Result<String> {
    let arguments = match args {
        Value::Object(map) => Some(map),
        Value::Null => None,
        other => bail!("arguments for {name} must be an object, got {other}"),
    };
    let result = peer
        .call_tool(CallToolRequestParam {
            name: name.clone().into(),
            arguments,
        })
        .await
        .with_context(|| format!("MCP call to {name} failed"))?;
    render_result(result)
}

/// Joins the text parts of a result; server-reported errors become `Err`.
fn render_result(result: CallToolResult) -> anyhow::Result<String> {
    let mut parts: Vec<String> = result
        .content
        .into_iter()
        .filter_map(|content| match content.raw {
            RawContent::Text(text) => Some(text.text),
            RawContent::Resource(_) => Some("[resource]".to_string()),
            RawContent::ResourceLink(link) => Some(format!("[resource_link] {}", link.uri)),
            RawContent::Image(_) | RawContent::Audio(_) => None,
        })
        .collect();
    if parts.is_empty()
        && let Some(structured) = result.structured_content
    {
        parts.push(structured.to_string());
    }

    let text = parts.join("\n");
    if result.is_error.unwrap_or(false) {
        return Err(anyhow!(if text.is_empty() {
            "tool reported an error".to_string()
        } else {
            text
        }));
    }
    Ok(text)
}

/// Removes `$schema` and `additionalProperties` at every depth.
pub fn clean_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, clean_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_schema).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use rmcp::model::Content;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_clean_schema_strips_nested_keys() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {"path": {"type": "string"}}
                    }
                },
                "mode": {"anyOf": [{"type": "string", "additionalProperties": true}]}
            },
            "required": ["files"]
        });

        let cleaned = clean_schema(schema);
        assert_eq!(
            cleaned,
            json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {"path": {"type": "string"}}
                        }
                    },
                    "mode": {"anyOf": [{"type": "string"}]}
                },
                "required": ["files"]
            })
        );
    }

    #[test]
    fn test_clean_schema_leaves_scalars_alone() {
        assert_eq!(clean_schema(json!("x")), json!("x"));
        assert_eq!(clean_schema(json!([1, {"$schema": 1}])), json!([1, {}]));
    }

    #[test]
    fn test_render_result_joins_text() {
        let result = CallToolResult::success(vec![Content::text("one"), Content::text("two")]);
        assert_eq!(render_result(result).unwrap(), "one\ntwo");
    }

    #[test]
    fn test_render_result_error_flag() {
        let result = CallToolResult::error(vec![Content::text("Not Found: repo")]);
        let err = render_result(result).unwrap_err();
        assert_eq!(err.to_string(), "Not Found: repo");
    }

    #[tokio::test]
    async fn test_missing_command_is_spawn_error() {
        let config = McpConfig {
            enabled: true,
            command: "cadet-definitely-not-a-real-binary".to_string(),
            args: vec![],
        };
        let err = discover(&config, "t", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ToolDiscoveryError::Spawn { .. }), "{err}");
        assert!(err.to_string().contains("cadet-definitely-not-a-real-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_that_exits_fails_handshake() {
        let config = McpConfig {
            enabled: true,
            command: "true".to_string(),
            args: vec![],
        };
        let err = discover(&config, "t", Duration::from_secs(5)).await.unwrap_err();
        assert!(
            matches!(
                err,
                ToolDiscoveryError::Handshake { .. } | ToolDiscoveryError::TimedOut(_)
            ),
            "{err}"
        );
    }
}
