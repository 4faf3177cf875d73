//! Core cadet library (conversation, execution graph, providers, tools, config).

pub mod config;
pub mod core;
pub mod providers;
pub mod tools;
