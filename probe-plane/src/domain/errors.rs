//! Structured error types for probe-plane
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{LifecycleState, SpeculationId};
use thiserror::Error;

/// Misuse of a speculative buffer handle
///
/// Always a logic defect in the generated probe code, so it is returned to
/// the caller instead of being downgraded to a diagnostic.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculationError {
    #[error("invalid speculative buffer id: {0}")]
    InvalidHandle(SpeculationId),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Cannot {action} a runtime in state {state}")]
    InvalidTransition { action: &'static str, state: LifecycleState },

    #[error("Unknown perf counter: {0}")]
    UnknownCounter(String),

    #[error("Perf counter {0} is already declared")]
    DuplicateCounter(String),

    #[error("Perf counter {name} holds a {actual} value, not {expected}")]
    CounterType { name: String, expected: &'static str, actual: &'static str },

    #[error("Failed to spawn {thread} thread")]
    ThreadSpawn {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Speculation(#[from] SpeculationError),

    #[error("Invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid queue capacity: {0} (must be at least 1)")]
    InvalidCapacity(usize),

    #[error("Invalid speculation limit {name}: {value} (must be at least 1)")]
    InvalidSpeculationLimit { name: &'static str, value: usize },

    #[error("Client name cannot be empty")]
    EmptyClientName,
}

/// Raised by probe or handler code to request that the client exits
///
/// Recognised by `RuntimeInstance::handle_exception`, which turns it into an
/// orderly `exit(code)` instead of an `Error` command.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("exit requested with code {0}")]
pub struct ExitRequested(pub i32);
