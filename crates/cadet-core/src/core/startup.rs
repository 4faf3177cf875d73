//! Credentials checked before anything else starts.

pub const MODEL_KEY_VAR: &str = "GOOGLE_API_KEY";
pub const GITHUB_TOKEN_VAR: &str = "GITHUB_TOKEN";

/// The only error class that stops the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    #[error("{var} is not set. Export it or add it to a .env file.")]
    MissingCredential { var: &'static str },
    #[error("invalid {name} URL '{value}': {reason}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct Credentials {
    pub model_api_key: String,
    /// Feeds the GitHub and MCP tool sources; their tools are skipped without it.
    pub github_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("model_api_key", &"<redacted>")
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Reads credentials from the process environment.
    ///
    /// # Errors
    /// Returns [`StartupError::MissingCredential`] when the model key is absent.
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads credentials through `lookup`; blank values count as missing.
    ///
    /// # Errors
    /// Returns [`StartupError::MissingCredential`] when the model key is absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, StartupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let model_api_key = read(MODEL_KEY_VAR).ok_or(StartupError::MissingCredential {
            var: MODEL_KEY_VAR,
        })?;
        let github_token = read(GITHUB_TOKEN_VAR);
        if github_token.is_none() {
            tracing::warn!("{GITHUB_TOKEN_VAR} not set; GitHub and MCP tools are disabled");
        }

        Ok(Self {
            model_api_key,
            github_token,
        })
    }
}

/// Validates an optional URL override, falling back to `default`.
///
/// # Errors
/// Returns [`StartupError::InvalidUrl`] if the override does not parse.
pub fn resolve_url(
    name: &'static str,
    env_value: Option<String>,
    config_value: Option<&str>,
    default: &str,
) -> Result<String, StartupError> {
    let chosen = env_value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| config_value.map(str::trim).filter(|v| !v.is_empty()).map(String::from));

    let Some(value) = chosen else {
        return Ok(default.to_string());
    };

    url::Url::parse(&value).map_err(|e| StartupError::InvalidUrl {
        name,
        value: value.clone(),
        reason: e.to_string(),
    })?;
    Ok(value.trim_end_matches('/').to_string())
}
