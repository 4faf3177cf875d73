//! Events emitted while a run progresses.
//!
//! The graph never prints. Renderers subscribe to these events and decide
//! how a model turn or a tool call is shown.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::providers::BackendErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A model turn produced text. `text` is already option-numbered.
    AssistantCompleted { text: String, option_count: usize },

    /// A tool request is about to be executed.
    ToolStarted { id: String, name: String, input: Value },

    /// A tool request finished (successfully or not).
    ToolCompleted {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// The run aborted.
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// The run was interrupted by a signal.
    Interrupted,

    /// The run reached `Done`.
    RunCompleted { steps: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    Protocol,
    /// The model kept asking for tools past the step limit.
    StepLimit,
    Internal,
}

impl From<BackendErrorKind> for ErrorKind {
    fn from(kind: BackendErrorKind) -> Self {
        match kind {
            BackendErrorKind::Timeout => ErrorKind::Timeout,
            BackendErrorKind::RateLimit => ErrorKind::RateLimit,
            BackendErrorKind::Protocol => ErrorKind::Protocol,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::StepLimit => write!(f, "step_limit"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

pub type AgentEventTx = mpsc::Sender<Arc<AgentEvent>>;
pub type AgentEventRx = mpsc::Receiver<Arc<AgentEvent>>;

pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

pub fn create_event_channel() -> (AgentEventTx, AgentEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Reliable event delivery. A dropped receiver is not an error.
#[derive(Clone)]
pub struct EventSender {
    tx: AgentEventTx,
}

impl EventSender {
    pub fn new(tx: AgentEventTx) -> Self {
        Self { tx }
    }

    pub async fn send(&self, ev: AgentEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let ev = AgentEvent::ToolCompleted {
            id: "c1".into(),
            name: "read_file".into(),
            output: "ok".into(),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({"type": "tool_completed", "id": "c1", "name": "read_file", "output": "ok", "is_error": false})
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_silent() {
        let (tx, rx) = create_event_channel();
        drop(rx);
        EventSender::new(tx).send(AgentEvent::Interrupted).await;
    }
}
