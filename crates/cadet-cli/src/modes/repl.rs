//! Line-oriented chat loop and event rendering.
//!
//! # Output contract
//! - assistant text, banner, help and tool listings → stdout
//! - tool progress, run errors and interrupts → stderr

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{Stdout, Write, stdout};
use std::time::Instant;

use anyhow::{Context, Result};
use cadet_core::core::events::{AgentEvent, AgentEventRx, EventSender, create_event_channel};
use cadet_core::core::interrupt;
use cadet_core::core::quiet::{self, Console};
use cadet_core::core::session::{Input, QUICK_START, Session};
use cadet_core::providers::ModelBackend;
use cadet_core::tools::{Provenance, ToolRegistry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

const PROMPT: &str = "Your request (or type 'help'): ";

/// Longest tool argument or output line echoed to stderr.
const PREVIEW_CHARS: usize = 200;

/// Renders agent events for one run.
pub struct ReplRenderer {
    stdout: Stdout,
    /// Original stderr; tools may have fd 2 silenced while events arrive.
    stderr: Console,
    /// Tool start times, keyed by request id.
    tool_start_times: HashMap<String, Instant>,
}

impl Default for ReplRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplRenderer {
    pub fn new() -> Self {
        Self {
            stdout: stdout(),
            stderr: quiet::console(),
            tool_start_times: HashMap::new(),
        }
    }

    pub fn handle_event(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::AssistantCompleted { text, .. } => {
                if !text.trim().is_empty() {
                    let _ = writeln!(self.stdout, "\n{text}\n");
                    let _ = self.stdout.flush();
                }
            }
            AgentEvent::ToolStarted { id, name, input } => {
                self.tool_start_times.insert(id.clone(), Instant::now());
                let _ = write!(
                    self.stderr,
                    "⚙ Running {name}({})...",
                    preview(&input.to_string())
                );
                let _ = self.stderr.flush();
            }
            AgentEvent::ToolCompleted {
                id,
                output,
                is_error,
                ..
            } => {
                let duration = self
                    .tool_start_times
                    .remove(id)
                    .map(|start| format!(" ({:.2}s)", start.elapsed().as_secs_f64()))
                    .unwrap_or_default();
                let status = if *is_error { "Failed" } else { "Done" };
                let _ = writeln!(self.stderr, " {status}.{duration}");
                let _ = writeln!(self.stderr, "  {}", preview(output));
            }
            AgentEvent::Error {
                kind,
                message,
                details,
            } => {
                let _ = writeln!(self.stderr, "Error [{kind}]: {message}");
                if let Some(detail_text) = details {
                    let _ = writeln!(self.stderr, "  Details: {detail_text}");
                }
            }
            AgentEvent::Interrupted => {
                let _ = writeln!(self.stderr, "\n^C Interrupted.");
            }
            AgentEvent::RunCompleted { steps } => {
                debug!(steps, "run rendered");
            }
        }
    }
}

fn preview(output: &str) -> String {
    let first_line = output.lines().next().unwrap_or_default();
    if first_line.chars().count() > PREVIEW_CHARS {
        let cut: String = first_line.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        first_line.to_string()
    }
}

/// Consumes events until every sender is dropped.
pub fn spawn_renderer_task(mut rx: AgentEventRx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut renderer = ReplRenderer::new();
        while let Some(event) = rx.recv().await {
            renderer.handle_event(&event);
        }
    })
}

/// Runs the chat loop until `exit`, end of input or an interrupt at the prompt.
///
/// # Errors
/// Returns an error if stdin cannot be read.
pub async fn run<B: ModelBackend>(mut session: Session<B>) -> Result<()> {
    print!("{}", banner(&session));
    let _ = stdout().flush();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{PROMPT}");
        let _ = stdout().flush();

        let line = tokio::select! {
            biased;
            () = interrupt::wait_for_interrupt() => {
                interrupt::reset();
                println!();
                None
            }
            line = lines.next_line() => line.context("read input")?,
        };
        let Some(line) = line else {
            println!("Goodbye!");
            return Ok(());
        };

        let selected = session.option_map().get(line.trim()).map(str::to_string);
        match session.parse(&line) {
            Input::Empty => {}
            Input::Exit => {
                println!("Goodbye!");
                return Ok(());
            }
            Input::Help => print!("{}", help_text()),
            Input::Tools => print!("{}", tools_text(session.registry())),
            Input::Utterance(utterance) => {
                if let Some(option) = selected {
                    println!("Selected: {option}");
                }
                submit(&mut session, &utterance).await;
            }
        }
    }
}

/// One run with its own event channel; returns once everything is rendered.
async fn submit<B: ModelBackend>(session: &mut Session<B>, utterance: &str) {
    let (tx, rx) = create_event_channel();
    let renderer = spawn_renderer_task(rx);
    let events = EventSender::new(tx);

    // Failures were already reported as events.
    if let Err(err) = session.submit(utterance, &events).await {
        debug!("run ended early: {err}");
    }

    drop(events);
    let _ = renderer.await;
}

fn banner<B: ModelBackend>(session: &Session<B>) -> String {
    let mut out = String::new();
    let registry = session.registry();
    let _ = writeln!(
        out,
        "cadet ready: thread '{}', {} tools",
        session.thread_id(),
        registry.len()
    );
    let restored = session.history_len();
    if restored > 0 {
        let _ = writeln!(out, "Resumed {restored} messages from checkpoint.");
    }
    out.push('\n');
    out.push_str(&quick_start_text());
    out
}

fn quick_start_text() -> String {
    let mut out = String::from("Quick start:\n");
    for (i, option) in QUICK_START.iter().enumerate() {
        let _ = writeln!(out, "  {}. {option}", i + 1);
    }
    out.push('\n');
    out
}

fn help_text() -> String {
    let mut out = String::from(
        "Commands:\n  help             show this message\n  tools            list available tools\n  exit, quit, q    end the session\n\nType a number to pick an option from the last answer.\n\n",
    );
    out.push_str(&quick_start_text());
    out
}

fn section_title(provenance: Provenance) -> &'static str {
    match provenance {
        Provenance::Local => "Local",
        Provenance::RemoteApi => "GitHub",
        Provenance::Discovered => "MCP",
    }
}

fn tools_text(registry: &ToolRegistry) -> String {
    let mut out = String::new();
    let mut current = None;
    for handle in registry.list() {
        let provenance = handle.provenance();
        if current != Some(provenance) {
            let _ = writeln!(
                out,
                "{} ({}):",
                section_title(provenance),
                registry.count_by(provenance)
            );
            current = Some(provenance);
        }
        let summary = handle
            .definition()
            .description
            .lines()
            .next()
            .unwrap_or_default();
        let _ = writeln!(out, "  {:<20} {summary}", handle.name());
    }
    if out.is_empty() {
        out.push_str("No tools available.\n");
    }
    out.push('\n');
    out
}
