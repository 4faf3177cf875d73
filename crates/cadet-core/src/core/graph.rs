//! Execution graph.
//!
//! A run starts in `ModelTurn`. After each model turn the conditional edge
//! looks at the assistant message just appended: tool requests route to
//! `ToolTurn`, anything else ends the run. `ToolTurn` always routes back to
//! `ModelTurn`. The graph itself has no bound on alternations; the host passes
//! `max_steps`, checked on every `ModelTurn` entry.
//!
//! Backend errors abort the run and propagate. Tool errors never do: they are
//! written into the conversation as results the model sees on its next turn.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::conversation::{Conversation, Message, ToolCall};
use crate::core::events::{AgentEvent, EventSender};
use crate::core::interrupt::{self, InterruptedError};
use crate::core::options::{self, OptionMap};
use crate::core::quiet;
use crate::core::steering::{KeywordSteering, SteeringPolicy};
use crate::providers::{BackendError, ModelBackend};
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_STEPS: usize = 25;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You MUST call tools. NEVER just talk. \
For 'push folder': call push_folder(owner, repo, folder_path, branch, message). \
For 'push file': call quick_push_file(owner, repo, file_path, branch, message). \
DO NOT ask questions, CALL THE TOOL NOW.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    ModelTurn,
    ToolTurn,
}

/// Conditional edge evaluated after a `ModelTurn`. `None` means done.
pub fn route(conversation: &Conversation) -> Option<Node> {
    if conversation.pending_tool_calls().is_empty() {
        None
    } else {
        Some(Node::ToolTurn)
    }
}

/// The model kept requesting tools until the step budget ran out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("model did not produce a final answer within {limit} steps")]
pub struct RunStepLimitExceeded {
    pub limit: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("model backend failed ({kind}): {0}", kind = .0.kind)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    StepLimit(#[from] RunStepLimitExceeded),
    #[error(transparent)]
    Interrupted(#[from] InterruptedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Turns executed, model and tool turns alike.
    pub steps: usize,
}

pub struct ExecutionGraph<B> {
    backend: B,
    registry: Arc<ToolRegistry>,
    steering: Box<dyn SteeringPolicy>,
    system_prompt: String,
    max_steps: usize,
    tool_timeout: Option<Duration>,
}

impl<B: ModelBackend> ExecutionGraph<B> {
    pub fn new(backend: B, registry: Arc<ToolRegistry>) -> Self {
        Self {
            backend,
            registry,
            steering: Box::new(KeywordSteering::default()),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            tool_timeout: None,
        }
    }

    #[must_use]
    pub fn with_steering(mut self, steering: impl SteeringPolicy + 'static) -> Self {
        self.steering = Box::new(steering);
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    #[must_use]
    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Drives one run to `Done`.
    ///
    /// `option_map` is replaced whenever a model turn produces text.
    ///
    /// # Errors
    /// Returns a [`RunError`] if the backend fails, the step limit is hit,
    /// or an interrupt is raised.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        option_map: &mut OptionMap,
        events: &EventSender,
    ) -> Result<RunReport, RunError> {
        let mut steps = 0;
        let mut node = Node::ModelTurn;

        loop {
            match node {
                Node::ModelTurn => {
                    if steps >= self.max_steps {
                        warn!(steps, limit = self.max_steps, "step limit reached");
                        return Err(RunStepLimitExceeded {
                            limit: self.max_steps,
                        }
                        .into());
                    }
                    ensure_not_interrupted()?;
                    self.model_turn(conversation, option_map, events).await?;
                    steps += 1;
                    match route(conversation) {
                        Some(next) => node = next,
                        None => break,
                    }
                }
                Node::ToolTurn => {
                    self.tool_turn(conversation, events).await?;
                    steps += 1;
                    node = Node::ModelTurn;
                }
            }
        }

        debug_assert!(conversation.unanswered_calls().is_empty());
        debug!(steps, "run completed");
        events.send(AgentEvent::RunCompleted { steps }).await;
        Ok(RunReport { steps })
    }

    async fn model_turn(
        &self,
        conversation: &mut Conversation,
        option_map: &mut OptionMap,
        events: &EventSender,
    ) -> Result<(), RunError> {
        conversation.set_system(self.system_prompt.as_str());

        let steered = conversation
            .trailing_human()
            .and_then(|text| self.steering.steer(text))
            .map(|directive| {
                debug!("steering trailing human message");
                let mut request = conversation.clone();
                request.append_to_trailing_human(&directive);
                request
            });
        let request = steered.as_ref().unwrap_or(conversation);
        let tools = self.registry.definitions();

        let response = tokio::select! {
            biased;
            () = interrupt::wait_for_interrupt() => return Err(InterruptedError.into()),
            result = self.backend.generate(request, &tools) => result?,
        };

        let Message::Assistant { content, .. } = &response else {
            return Err(BackendError::protocol(format!(
                "backend returned a {} message instead of an assistant turn",
                response.role()
            ))
            .into());
        };

        if let Some(text) = content.as_deref().filter(|t| !t.trim().is_empty()) {
            let rendered = options::render(text);
            let option_count = rendered.options.len();
            *option_map = rendered.options;
            events
                .send(AgentEvent::AssistantCompleted {
                    text: rendered.text,
                    option_count,
                })
                .await;
        }

        conversation.push(response);
        Ok(())
    }

    async fn tool_turn(
        &self,
        conversation: &mut Conversation,
        events: &EventSender,
    ) -> Result<(), RunError> {
        let calls = conversation.pending_tool_calls().to_vec();
        let mut results = Vec::with_capacity(calls.len());
        let mut interrupted = false;

        for call in &calls {
            if interrupted || interrupt::is_interrupted() {
                // Every request still gets an answer so the history stays well-formed.
                interrupted = true;
                results.push(Message::tool_result(
                    &call.id,
                    "Tool error: interrupted before execution",
                ));
                continue;
            }

            events
                .send(AgentEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.args.clone(),
                })
                .await;

            let (output, is_error) = self.invoke(call).await;

            events
                .send(AgentEvent::ToolCompleted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: output.clone(),
                    is_error,
                })
                .await;
            results.push(Message::tool_result(&call.id, output));
        }

        conversation.merge(results);

        if interrupted {
            return Err(InterruptedError.into());
        }
        Ok(())
    }

    /// Looks up and runs one request; every outcome becomes result text.
    async fn invoke(&self, call: &ToolCall) -> (String, bool) {
        let handle = match self.registry.lookup(&call.name) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.id, "unknown tool requested");
                return (err.to_string(), true);
            }
        };

        info!(tool = %call.name, call_id = %call.id, async_call = handle.invocation().is_async(), "invoking tool");
        let _quiet = quiet::suppress_stderr();
        match handle.invoke(call.args.clone(), self.tool_timeout).await {
            Ok(output) => (output, false),
            Err(err) => {
                warn!(tool = %call.name, error = %err, "tool failed");
                (format!("Tool error: {err}"), true)
            }
        }
    }
}

fn ensure_not_interrupted() -> Result<(), InterruptedError> {
    if interrupt::is_interrupted() {
        Err(InterruptedError)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::core::events::create_event_channel;
    use crate::core::steering::{NoSteering, TOOL_DIRECTIVE};
    use crate::providers::scripted::ScriptedBackend;
    use crate::tools::{Provenance, ToolDefinition, ToolHandle};

    fn silent_events() -> EventSender {
        let (tx, _rx) = create_event_channel();
        EventSender::new(tx)
    }

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, "test tool", json!({"type": "object"}))
    }

    fn registry(handles: Vec<ToolHandle>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(handles).unwrap();
        Arc::new(registry)
    }

    fn human(text: &str) -> Conversation {
        Conversation::from_messages(vec![Message::human(text)])
    }

    #[test]
    fn test_route_follows_tool_requests() {
        let mut conversation = human("hi");
        conversation.push(Message::assistant_text("hello"));
        assert_eq!(route(&conversation), None);

        conversation.push(Message::assistant_calls(
            None,
            vec![ToolCall::new("c1", "ls", json!({}))],
        ));
        assert_eq!(route(&conversation), Some(Node::ToolTurn));
    }

    /// Text answer: one model turn, options rendered, system slot written.
    #[tokio::test]
    async fn test_text_answer_renders_options() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let backend = ScriptedBackend::new([Ok(Message::assistant_text(
            "Choose:\n- Deploy\n- Roll back",
        ))]);
        let graph = ExecutionGraph::new(backend, registry(vec![])).with_system_prompt("be brief");
        let (tx, mut rx) = create_event_channel();
        let events = EventSender::new(tx);

        let mut conversation = human("what now?");
        let mut options = OptionMap::default();
        let report = graph.run(&mut conversation, &mut options, &events).await.unwrap();

        assert_eq!(report.steps, 1);
        assert_eq!(conversation.messages()[0], Message::system("be brief"));
        assert_eq!(conversation.len(), 3);
        assert_eq!(options::resolve("2", &options), "Roll back");

        let first = rx.recv().await.unwrap();
        match first.as_ref() {
            AgentEvent::AssistantCompleted { text, option_count } => {
                assert_eq!(*option_count, 2);
                assert!(text.contains("**2.** Roll back"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// Tool results land in request order regardless of calling convention.
    #[tokio::test]
    async fn test_tool_results_follow_request_order() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let sync = ToolHandle::sync(def("local_echo"), Provenance::Local, |args| {
            Ok(format!("local:{}", args["v"]))
        });
        let remote = ToolHandle::asynchronous(def("remote_echo"), Provenance::RemoteApi, |args| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, anyhow::Error>(format!("remote:{}", args["v"]))
        });
        let backend = ScriptedBackend::new([
            Ok(Message::assistant_calls(
                None,
                vec![
                    ToolCall::new("a", "remote_echo", json!({"v": 1})),
                    ToolCall::new("b", "local_echo", json!({"v": 2})),
                    ToolCall::new("c", "remote_echo", json!({"v": 3})),
                ],
            )),
            Ok(Message::assistant_text("done")),
        ]);
        let graph = ExecutionGraph::new(backend, registry(vec![sync, remote]));

        let mut conversation = human("go");
        let report = graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await
            .unwrap();
        assert_eq!(report.steps, 3);

        let results: Vec<_> = conversation
            .messages()
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult { call_id, content } => Some((call_id.as_str(), content.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![("a", "remote:1"), ("b", "local:2"), ("c", "remote:3")]
        );
        assert!(conversation.unanswered_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_result_and_run_continues() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let backend = ScriptedBackend::new([
            Ok(Message::assistant_calls(
                None,
                vec![ToolCall::new("x1", "does_not_exist", json!({}))],
            )),
            Ok(Message::assistant_text("sorry")),
        ]);
        let graph = ExecutionGraph::new(backend, registry(vec![]));

        let mut conversation = human("do it");
        graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await
            .unwrap();

        assert_eq!(
            conversation.messages()[3],
            Message::tool_result("x1", "Tool does_not_exist not found")
        );
        assert_eq!(conversation.last(), Some(&Message::assistant_text("sorry")));
    }

    /// A failing tool adds exactly one error result and the run goes on.
    #[tokio::test]
    async fn test_failing_tool_yields_error_result() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let failing = ToolHandle::sync(def("flaky"), Provenance::Local, |_| {
            anyhow::bail!("permission denied")
        });
        let backend = ScriptedBackend::new([
            Ok(Message::assistant_calls(
                None,
                vec![ToolCall::new("f1", "flaky", json!({}))],
            )),
            Ok(Message::assistant_text("it failed")),
        ]);
        let seen = backend.requests();
        let graph = ExecutionGraph::new(backend, registry(vec![failing]));

        let mut conversation = human("try");
        graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await
            .unwrap();

        let second_request = seen.lock().unwrap()[1].clone();
        assert_eq!(
            second_request.last(),
            Some(&Message::tool_result("f1", "Tool error: permission denied"))
        );
        // system + human + assistant(call) + one result
        assert_eq!(second_request.len(), 4);
    }

    #[tokio::test]
    async fn test_step_limit_aborts_looping_model() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let ping = ToolHandle::sync(def("ping"), Provenance::Local, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("pong".to_string())
        });
        let graph = ExecutionGraph::new(ScriptedBackend::looping("ping"), registry(vec![ping]))
            .with_max_steps(4);

        let mut conversation = human("loop forever");
        let err = graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::StepLimit(RunStepLimitExceeded { limit: 4 })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Every request issued before the abort has its answer.
        assert!(conversation.unanswered_calls().is_empty());
        assert_eq!(conversation.len(), 6);
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let backend = ScriptedBackend::new([Err(BackendError::rate_limit("quota"))]);
        let graph = ExecutionGraph::new(backend, registry(vec![]));

        let mut conversation = human("hi");
        let err = graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Backend(ref e) if e.kind == crate::providers::BackendErrorKind::RateLimit));
        assert!(err.to_string().contains("rate_limit"));
    }

    #[test]
    fn test_backend_error_display_names_kind() {
        let err = RunError::from(BackendError::timeout("deadline exceeded"));
        assert_eq!(
            err.to_string(),
            "model backend failed (timeout): deadline exceeded"
        );
    }

    /// An interrupt during one tool leaves the rest unrun but answered.
    #[tokio::test]
    async fn test_interrupt_answers_remaining_requests() {
        let _flag = interrupt::TEST_FLAG.write().await;
        interrupt::reset();

        let first = ToolHandle::sync(def("first"), Provenance::Local, |_| {
            interrupt::trigger();
            Ok("first done".to_string())
        });
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let second = ToolHandle::sync(def("second"), Provenance::Local, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("second done".to_string())
        });
        let backend = ScriptedBackend::new([
            Ok(Message::assistant_calls(
                None,
                vec![
                    ToolCall::new("c1", "first", json!({})),
                    ToolCall::new("c2", "second", json!({})),
                ],
            )),
            Ok(Message::assistant_text("never reached")),
        ]);
        let seen = backend.requests();
        let graph = ExecutionGraph::new(backend, registry(vec![first, second]));

        let mut conversation = human("run both");
        let result = graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await;
        let raised = interrupt::is_interrupted();
        interrupt::reset();

        assert!(matches!(result, Err(RunError::Interrupted(_))));
        assert!(raised);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(conversation.unanswered_calls().is_empty());
        let tail = &conversation.messages()[conversation.len() - 2..];
        assert_eq!(
            tail,
            [
                Message::tool_result("c1", "first done"),
                Message::tool_result("c2", "Tool error: interrupted before execution"),
            ]
        );
    }

    /// Steering reaches the backend but never the stored conversation.
    #[tokio::test]
    async fn test_steering_applies_to_request_only() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let backend = ScriptedBackend::new([Ok(Message::assistant_text("ok"))]);
        let seen = backend.requests();
        let graph = ExecutionGraph::new(backend, registry(vec![]));

        let mut conversation = human("push my folder to github");
        graph
            .run(&mut conversation, &mut OptionMap::default(), &silent_events())
            .await
            .unwrap();

        let sent = seen.lock().unwrap()[0].clone();
        assert_eq!(
            sent.trailing_human(),
            Some(format!("push my folder to github{TOOL_DIRECTIVE}").as_str())
        );
        assert_eq!(
            conversation.messages()[1],
            Message::human("push my folder to github")
        );
    }

    #[tokio::test]
    async fn test_system_slot_never_duplicates_across_runs() {
        let _flag = interrupt::TEST_FLAG.read().await;
        let backend = ScriptedBackend::new([
            Ok(Message::assistant_text("one")),
            Ok(Message::assistant_text("two")),
        ]);
        let graph = ExecutionGraph::new(backend, registry(vec![])).with_steering(NoSteering);

        let mut conversation = human("first");
        let mut options = OptionMap::default();
        graph.run(&mut conversation, &mut options, &silent_events()).await.unwrap();
        conversation.push(Message::human("second"));
        graph.run(&mut conversation, &mut options, &silent_events()).await.unwrap();

        assert_eq!(conversation.system_count(), 1);
        assert_eq!(conversation.len(), 5);
    }
}
