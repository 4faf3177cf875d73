//! Model backends.
//!
//! A backend takes the whole conversation plus the tool schemas and returns
//! exactly one assistant message. Retries live inside the backend.

pub mod gemini;
#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

pub use gemini::{GeminiClient, GeminiConfig};

use crate::core::conversation::{Conversation, Message};
use crate::tools::ToolDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Connection or request timeout.
    Timeout,
    /// HTTP 429 or quota exhaustion.
    RateLimit,
    /// Anything else: bad status, undecodable body, empty candidate list.
    Protocol,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Timeout => write!(f, "timeout"),
            BackendErrorKind::RateLimit => write!(f, "rate_limit"),
            BackendErrorKind::Protocol => write!(f, "protocol"),
        }
    }
}

/// Failure of one `generate` call after the backend gave up retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::RateLimit, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Protocol, message)
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// The language-model capability consumed by the execution graph.
pub trait ModelBackend: Send + Sync {
    /// Produces one `Message::Assistant` for `conversation`.
    fn generate(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> impl Future<Output = Result<Message, BackendError>> + Send;
}
