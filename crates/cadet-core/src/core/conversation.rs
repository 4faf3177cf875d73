//! Typed chat history.
//!
//! A `Conversation` is append-only during a run. The only in-place edit is the
//! system slot: index 0 holds at most one `System` message, and writing a new
//! instruction replaces it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id, generated on our side when the response is decoded.
    pub id: String,
    pub name: String,
    /// Argument object as sent by the model.
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    Human {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::Human {
            content: content.into(),
        }
    }

    /// Assistant message with plain text and no tool requests.
    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content,
            tool_calls,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    /// Tool requests carried by this message (empty for non-assistant roles).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Short role label used in transcripts and logs.
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Human { .. } => "human",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool",
        }
    }
}

/// Ordered message history for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a conversation from stored messages, normalizing the system slot.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let mut conversation = Self::new();
        conversation.merge(messages);
        conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends one message. A `System` message goes to the system slot instead.
    pub fn push(&mut self, message: Message) {
        match message {
            Message::System { content } => self.set_system(content),
            other => self.messages.push(other),
        }
    }

    /// Appends a batch in order.
    pub fn merge(&mut self, batch: impl IntoIterator<Item = Message>) {
        for message in batch {
            self.push(message);
        }
    }

    /// Writes the system instruction into slot 0, replacing any existing one.
    pub fn set_system(&mut self, content: impl Into<String>) {
        let content = content.into();
        match self.messages.first_mut() {
            Some(Message::System { content: current }) => *current = content,
            _ => self.messages.insert(0, Message::System { content }),
        }
    }

    pub fn system_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_system()).count()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Tool requests on the trailing message, if it is an assistant turn.
    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        self.messages.last().map_or(&[], Message::tool_calls)
    }

    /// Requests in the whole history that never received a `ToolResult`.
    pub fn unanswered_calls(&self) -> Vec<&ToolCall> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        self.messages
            .iter()
            .flat_map(Message::tool_calls)
            .filter(|call| !answered.contains(call.id.as_str()))
            .collect()
    }

    /// Looks up the tool name a result belongs to.
    pub fn tool_name_for(&self, call_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .flat_map(Message::tool_calls)
            .find(|call| call.id == call_id)
            .map(|call| call.name.as_str())
    }

    /// Content of the trailing message when it is a human utterance.
    pub fn trailing_human(&self) -> Option<&str> {
        match self.messages.last() {
            Some(Message::Human { content }) => Some(content),
            _ => None,
        }
    }

    /// Appends `suffix` to the trailing human message. No-op for other roles.
    pub fn append_to_trailing_human(&mut self, suffix: &str) {
        if let Some(Message::Human { content }) = self.messages.last_mut() {
            content.push_str(suffix);
        }
    }
}
