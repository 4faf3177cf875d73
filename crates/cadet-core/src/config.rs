//! Configuration loading.
//!
//! `config.toml` lives under `CADET_HOME`. Every field has a default, so a
//! missing file or a partial one both work.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::steering::DEFAULT_KEYWORDS;

pub mod paths {
    //! Path resolution for cadet configuration and data.
    //!
    //! `CADET_HOME` resolution order:
    //! 1. `CADET_HOME` environment variable (if set)
    //! 2. `~/.config/cadet`
    //! 3. `./.cadet` when no home directory can be determined

    use std::path::PathBuf;

    pub fn cadet_home() -> PathBuf {
        if let Some(home) = std::env::var_os("CADET_HOME").filter(|h| !h.is_empty()) {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".cadet"),
            |h| h.join(".config").join("cadet"),
        )
    }

    pub fn config_path() -> PathBuf {
        cadet_home().join("config.toml")
    }

    pub fn logs_dir() -> PathBuf {
        cadet_home().join("logs")
    }
}

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Subprocess tool server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Set to false to skip discovery entirely.
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-github".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiSection {
    /// Overrides the API base URL (`GEMINI_BASE_URL` wins over this).
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSection {
    /// Overrides the REST API URL (`GITHUB_API_URL` wins over this).
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout for the model backend.
    pub request_timeout_secs: u64,
    /// Attempts after the first one on transient backend failures.
    pub max_retries: u32,
    /// Turn budget for a single run.
    pub max_steps: usize,
    /// Timeout for tool execution in seconds (0 disables).
    pub tool_timeout_secs: u64,
    /// Session checkpoint key.
    pub thread_id: String,
    /// Relative paths resolve under `CADET_HOME`.
    pub checkpoint_file: String,
    pub system_prompt: Option<String>,
    /// Words that trigger the call-a-tool directive.
    pub steering_keywords: Vec<String>,
    /// Command used by the `run_tests` tool.
    pub test_command: String,
    /// Fallback log filter when `CADET_LOG` is unset.
    pub log_level: String,
    pub mcp: McpConfig,
    pub gemini: GeminiSection,
    pub github: GithubSection,
}

impl Config {
    pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
    const DEFAULT_MAX_TOKENS: u32 = 2048;
    const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
    const DEFAULT_MAX_RETRIES: u32 = 3;
    const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_THREAD_ID: &str = "default_session";

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from `path`, returning defaults if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the commented default template to `path`.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }
        write_atomic(path, default_config_template())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        let file = PathBuf::from(&self.checkpoint_file);
        if file.is_absolute() {
            file
        } else {
            paths::cadet_home().join(file)
        }
    }

    /// Configured system prompt, if it is non-blank.
    pub fn system_prompt_override(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            request_timeout_secs: Self::DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            max_steps: crate::core::graph::DEFAULT_MAX_STEPS,
            tool_timeout_secs: Self::DEFAULT_TOOL_TIMEOUT_SECS,
            thread_id: Self::DEFAULT_THREAD_ID.to_string(),
            checkpoint_file: "checkpoints.db".to_string(),
            system_prompt: None,
            steering_keywords: DEFAULT_KEYWORDS.iter().map(ToString::to_string).collect(),
            test_command: "cargo test".to_string(),
            log_level: "info".to_string(),
            mcp: McpConfig::default(),
            gemini: GeminiSection::default(),
            github: GithubSection::default(),
        }
    }
}

/// Writes via a temp file and rename so a crash never leaves half a file.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}
