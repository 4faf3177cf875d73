//! Core module: UI-agnostic domain and runtime.
//!
//! This module contains:
//! - `conversation`: Typed chat history with system-slot replacement
//! - `options`: Bullet to numbered-option rewriting and resolution
//! - `steering`: Action-intent directive policy
//! - `graph`: ModelTurn / ToolTurn execution loop
//! - `events`: Events emitted while a run progresses
//! - `interrupt`: Signal handling for graceful interruption
//! - `quiet`: Scoped stderr suppression
//! - `checkpoint`: SQLite-backed conversation checkpoints
//! - `session`: Per-thread state and input handling
//! - `startup`: Fatal startup checks

pub mod checkpoint;
pub mod conversation;
pub mod events;
pub mod graph;
pub mod interrupt;
pub mod options;
pub mod quiet;
pub mod session;
pub mod startup;
pub mod steering;
