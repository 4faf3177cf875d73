//! Checkpoint command handlers.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use cadet_core::config::Config;
use cadet_core::core::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use cadet_core::core::conversation::{Conversation, Message};

/// Opens the store only if the database already exists, so read-only
/// commands never create one.
fn open_existing(config: &Config) -> Result<Option<SqliteCheckpointStore>> {
    let path = config.checkpoint_path();
    if !path.exists() {
        return Ok(None);
    }
    SqliteCheckpointStore::open(&path)
        .with_context(|| format!("open checkpoints at {}", path.display()))
        .map(Some)
}

pub fn list(config: &Config) -> Result<()> {
    let summaries = match open_existing(config)? {
        Some(store) => store.list().context("list checkpoints")?,
        None => Vec::new(),
    };
    if summaries.is_empty() {
        println!("No checkpoints found.");
        return Ok(());
    }
    for s in summaries {
        println!(
            "{}  {} messages  {}  ({} saved)",
            s.thread_id,
            s.message_count,
            format_timestamp(&s.saved_at),
            s.revisions
        );
    }
    Ok(())
}

pub fn show(config: &Config, id: &str) -> Result<()> {
    let conversation = match open_existing(config)? {
        Some(store) => store
            .load(id)
            .with_context(|| format!("load checkpoint '{id}'"))?,
        None => None,
    };
    match conversation {
        Some(conversation) if !conversation.is_empty() => {
            print!("{}", format_transcript(&conversation));
        }
        _ => println!("No checkpoint for thread '{id}'."),
    }
    Ok(())
}

pub fn clear(config: &Config, id: &str) -> Result<()> {
    let removed = match open_existing(config)? {
        Some(mut store) => store
            .clear(id)
            .with_context(|| format!("clear checkpoint '{id}'"))?,
        None => 0,
    };
    if removed == 0 {
        println!("No checkpoint for thread '{id}'.");
    } else {
        println!("Cleared {removed} checkpoint(s) for thread '{id}'.");
    }
    Ok(())
}

/// Local time for display; stored values are RFC 3339 UTC.
fn format_timestamp(saved_at: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(saved_at).map_or_else(
        |_| saved_at.to_string(),
        |t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        },
    )
}

fn format_transcript(conversation: &Conversation) -> String {
    let mut out = String::new();
    for message in conversation.messages() {
        match message {
            Message::System { content } => {
                let _ = writeln!(out, "[system] {content}\n");
            }
            Message::Human { content } => {
                let _ = writeln!(out, "You: {content}\n");
            }
            Message::Assistant {
                content,
                tool_calls,
            } => {
                if let Some(text) = content.as_deref().filter(|t| !t.is_empty()) {
                    let _ = writeln!(out, "Assistant: {text}\n");
                }
                for call in tool_calls {
                    let _ = writeln!(out, "Assistant -> {}({})", call.name, call.args);
                }
                if !tool_calls.is_empty() {
                    out.push('\n');
                }
            }
            Message::ToolResult { call_id, content } => {
                let name = conversation.tool_name_for(call_id).unwrap_or("?");
                let _ = writeln!(out, "[{name}] {content}\n");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use cadet_core::core::conversation::ToolCall;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_format_transcript() {
        let conversation = Conversation::from_messages(vec![
            Message::system("sys"),
            Message::human("list"),
            Message::assistant_calls(None, vec![ToolCall::new("c1", "list_files", json!({}))]),
            Message::tool_result("c1", "a.rs"),
            Message::assistant_text("1. a.rs"),
        ]);
        assert_eq!(
            format_transcript(&conversation),
            "[system] sys\n\nYou: list\n\nAssistant -> list_files({})\n\n[list_files] a.rs\n\nAssistant: 1. a.rs\n\n"
        );
    }

    #[test]
    fn test_format_timestamp_falls_back_to_raw() {
        assert_eq!(format_timestamp("yesterday"), "yesterday");
        assert_eq!(format_timestamp("2026-01-02T03:04:05+00:00").len(), 16);
    }
}
