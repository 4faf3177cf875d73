//! Per-thread session state.
//!
//! A `Session` owns the conversation, the current option map and the
//! checkpoint store. One utterance in, one complete run out; what happens to
//! the conversation afterwards depends on how the run ended:
//!
//! | outcome            | conversation          | checkpoint |
//! |--------------------|-----------------------|------------|
//! | done               | kept                  | saved      |
//! | step limit         | kept                  | saved      |
//! | backend error      | restored to pre-run   | untouched  |
//! | interrupted        | restored to pre-run   | untouched  |

use tracing::{error, info, warn};

use crate::core::checkpoint::{CheckpointError, CheckpointStore};
use crate::core::conversation::{Conversation, Message};
use crate::core::events::{AgentEvent, ErrorKind, EventSender};
use crate::core::graph::{ExecutionGraph, RunError, RunReport};
use crate::core::interrupt;
use crate::core::options::{self, OptionMap};
use crate::providers::ModelBackend;
use crate::tools::ToolRegistry;

/// Suggestions offered before the model has produced any options.
pub const QUICK_START: [&str; 5] = [
    "List all files in current directory",
    "Show available tools",
    "Run the tests",
    "Read the README.md file",
    "Search for code in the project",
];

/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Exit,
    Help,
    Tools,
    /// Free text for the model, with numeric shorthand already resolved.
    Utterance(String),
}

/// Classifies `raw`. Commands are matched case-insensitively; a bare number
/// that names a current option becomes that option's text.
pub fn parse_input(raw: &str, option_map: &OptionMap) -> Input {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "" => Input::Empty,
        "exit" | "quit" | "q" => Input::Exit,
        "help" => Input::Help,
        "tools" => Input::Tools,
        _ => Input::Utterance(options::resolve(trimmed, option_map).to_string()),
    }
}

pub struct Session<B> {
    thread_id: String,
    conversation: Conversation,
    option_map: OptionMap,
    graph: ExecutionGraph<B>,
    store: Box<dyn CheckpointStore>,
}

impl<B: ModelBackend> Session<B> {
    /// Opens `thread_id`, resuming from its latest checkpoint if there is one.
    ///
    /// # Errors
    /// Returns an error if the existing checkpoint cannot be read.
    pub fn open(
        thread_id: impl Into<String>,
        graph: ExecutionGraph<B>,
        store: Box<dyn CheckpointStore>,
    ) -> Result<Self, CheckpointError> {
        let thread_id = thread_id.into();
        let conversation = store.load(&thread_id)?.unwrap_or_default();
        if conversation.is_empty() {
            info!(thread_id, "starting new session");
        } else {
            info!(thread_id, messages = conversation.len(), "resumed session from checkpoint");
        }

        Ok(Self {
            thread_id,
            conversation,
            option_map: OptionMap::from_options(QUICK_START),
            graph,
            store,
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn option_map(&self) -> &OptionMap {
        &self.option_map
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.graph.registry()
    }

    /// Number of non-system messages restored from or added to this thread.
    pub fn history_len(&self) -> usize {
        self.conversation
            .messages()
            .iter()
            .filter(|m| !m.is_system())
            .count()
    }

    pub fn parse(&self, raw: &str) -> Input {
        parse_input(raw, &self.option_map)
    }

    /// Runs the graph for one utterance and settles the outcome.
    ///
    /// The session stays usable whatever the result; the error is returned
    /// so the caller can decide how loudly to report it.
    ///
    /// # Errors
    /// Returns the [`RunError`] that aborted the run.
    pub async fn submit(
        &mut self,
        utterance: &str,
        events: &EventSender,
    ) -> Result<RunReport, RunError> {
        let snapshot = (self.conversation.clone(), self.option_map.clone());
        interrupt::reset();

        self.conversation.push(Message::human(utterance));
        let result = self
            .graph
            .run(&mut self.conversation, &mut self.option_map, events)
            .await;

        match &result {
            Ok(report) => {
                info!(thread_id = %self.thread_id, steps = report.steps, "run completed");
                self.persist(events).await;
            }
            Err(RunError::StepLimit(err)) => {
                warn!(thread_id = %self.thread_id, "{err}");
                events
                    .send(AgentEvent::Error {
                        kind: ErrorKind::StepLimit,
                        message: err.to_string(),
                        details: None,
                    })
                    .await;
                self.persist(events).await;
            }
            Err(RunError::Backend(err)) => {
                error!(thread_id = %self.thread_id, kind = %err.kind, "{err}");
                (self.conversation, self.option_map) = snapshot;
                events
                    .send(AgentEvent::Error {
                        kind: err.kind.into(),
                        message: err.message.clone(),
                        details: err.details.clone(),
                    })
                    .await;
            }
            Err(RunError::Interrupted(_)) => {
                info!(thread_id = %self.thread_id, "run interrupted");
                (self.conversation, self.option_map) = snapshot;
                interrupt::reset();
                events.send(AgentEvent::Interrupted).await;
            }
        }

        result
    }

    async fn persist(&mut self, events: &EventSender) {
        if let Err(err) = self.store.save(&self.thread_id, &self.conversation) {
            error!(thread_id = %self.thread_id, error = %err, "checkpoint save failed");
            events
                .send(AgentEvent::Error {
                    kind: ErrorKind::Internal,
                    message: format!("Could not save checkpoint: {err}"),
                    details: None,
                })
                .await;
        }
    }
}
