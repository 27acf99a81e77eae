//! Command sinks
//!
//! Listeners a runtime instance can deliver to when no wire transport is
//! attached: a JSON-lines writer for offline inspection and an in-memory
//! collector for tests and summaries.

pub mod collect;
pub mod json_lines;

pub use collect::CollectingSink;
pub use json_lines::JsonLinesSink;
