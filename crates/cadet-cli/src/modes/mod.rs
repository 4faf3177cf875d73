//! Runtime execution modes.
//!
//! - `repl`: line-oriented chat over stdin/stdout

pub mod repl;
