//! In-memory backend for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::{BackendError, ModelBackend};
use crate::core::conversation::{Conversation, Message, ToolCall};
use crate::tools::ToolDefinition;

/// Replays queued responses and records every request it receives.
pub(crate) struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Message, BackendError>>>,
    looping_tool: Option<String>,
    counter: AtomicUsize,
    requests: Arc<Mutex<Vec<Conversation>>>,
}

impl ScriptedBackend {
    pub(crate) fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<Message, BackendError>>,
    {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            looping_tool: None,
            counter: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always asks for `tool`, never answers in text.
    pub(crate) fn looping(tool: &str) -> Self {
        let mut backend = Self::new([]);
        backend.looping_tool = Some(tool.to_string());
        backend
    }

    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<Conversation>>> {
        Arc::clone(&self.requests)
    }
}

impl ModelBackend for ScriptedBackend {
    async fn generate(
        &self,
        conversation: &Conversation,
        _tools: &[ToolDefinition],
    ) -> Result<Message, BackendError> {
        self.requests.lock().unwrap().push(conversation.clone());

        if let Some(tool) = &self.looping_tool {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            return Ok(Message::assistant_calls(
                None,
                vec![ToolCall::new(format!("loop-{n}"), tool.clone(), json!({}))],
            ));
        }

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::protocol("script exhausted")))
    }
}
