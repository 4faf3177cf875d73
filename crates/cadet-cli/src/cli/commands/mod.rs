//! CLI command handlers.

pub mod chat;
pub mod checkpoints;
pub mod config;
