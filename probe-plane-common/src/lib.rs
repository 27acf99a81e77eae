//! # Shared Boundary Types (Runtime ↔ Transport)
//!
//! Defines the command model that flows out of the probe runtime and the
//! listener contract a transport implements to receive it. Kept free of the
//! runtime's own dependencies so that transports and observers can depend on
//! this crate alone.
//!
//! ## Key Types
//!
//! - [`Command`] - Tagged command/event delivered to the observer
//! - [`CommandKind`] - Discriminant of a [`Command`], cheap to copy and match
//! - [`CommandListener`] - Sink invoked once per delivered command

use std::fmt;
use std::io;

// ============================================================================
// Constants
// ============================================================================

/// Default capacity of a client's outbound command queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Environment variable overriding [`DEFAULT_QUEUE_CAPACITY`]
pub const QUEUE_CAPACITY_ENV: &str = "PROBE_PLANE_CMD_QUEUE_LIMIT";

/// Event name selecting the catch-all event handler
pub const ALL_EVENTS: &str = "*";

// ============================================================================
// Commands
// ============================================================================

/// Command sent from the runtime to the observer (or, for `Event` and `Exit`,
/// from the observer to the runtime)
///
/// Commands are immutable once constructed; sending one moves it into the
/// outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum Command {
    /// Free-form text produced by a probe
    ///
    /// `timestamp` is nanoseconds since the runtime started, or 0 when
    /// message timestamps are disabled.
    Message { text: String, timestamp: u64 },

    /// Uncaught probe failure, rendered with its full cause chain
    Error { cause: String },

    /// The client is shutting down with the given exit code
    Exit { code: i32 },

    /// Named event; `None` addresses the catch-all handler
    Event { name: Option<String> },

    /// Acknowledgement
    Okay,

    /// The client was registered under a different name than requested
    Rename { new_name: String },

    /// Retransformation of `count` classes/units is starting
    RetransformStart { count: u32 },

    /// A single unit has been retransformed
    RetransformNotify { class_name: String },
}

/// Discriminant of a [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Message,
    Error,
    Exit,
    Event,
    Okay,
    Rename,
    RetransformStart,
    RetransformNotify,
}

impl Command {
    /// Untimestamped message
    pub fn message(text: impl Into<String>) -> Self {
        Command::Message { text: text.into(), timestamp: 0 }
    }

    /// Message stamped with `timestamp` nanoseconds
    pub fn message_at(text: impl Into<String>, timestamp: u64) -> Self {
        Command::Message { text: text.into(), timestamp }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Command::Error { cause: cause.into() }
    }

    pub fn exit(code: i32) -> Self {
        Command::Exit { code }
    }

    /// Event addressed to a named handler, or to the catch-all handler when `name` is `None`
    pub fn event(name: Option<impl Into<String>>) -> Self {
        Command::Event { name: name.map(Into::into) }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Message { .. } => CommandKind::Message,
            Command::Error { .. } => CommandKind::Error,
            Command::Exit { .. } => CommandKind::Exit,
            Command::Event { .. } => CommandKind::Event,
            Command::Okay => CommandKind::Okay,
            Command::Rename { .. } => CommandKind::Rename,
            Command::RetransformStart { .. } => CommandKind::RetransformStart,
            Command::RetransformNotify { .. } => CommandKind::RetransformNotify,
        }
    }

    /// Exit commands are never buffered speculatively and never dropped
    pub fn is_exit(&self) -> bool {
        matches!(self, Command::Exit { .. })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Message { text, .. } => write!(f, "{text}"),
            Command::Error { cause } => write!(f, "error: {cause}"),
            Command::Exit { code } => write!(f, "exit({code})"),
            Command::Event { name: Some(name) } => write!(f, "event {name}"),
            Command::Event { name: None } => write!(f, "event {ALL_EVENTS}"),
            Command::Okay => write!(f, "ok"),
            Command::Rename { new_name } => write!(f, "renamed to {new_name}"),
            Command::RetransformStart { count } => write!(f, "retransforming {count}"),
            Command::RetransformNotify { class_name } => write!(f, "retransformed {class_name}"),
        }
    }
}

// ============================================================================
// Listener Contract
// ============================================================================

/// Outbound sink for delivered commands
///
/// Invoked from the single delivery thread of a runtime instance, once per
/// command, in delivery order. Errors are logged by the runtime and never stop
/// delivery.
pub trait CommandListener: Send {
    /// Handle one delivered command
    ///
    /// # Errors
    /// Returns an I/O error when the command could not be forwarded
    fn on_command(&mut self, cmd: Command) -> io::Result<()>;
}

impl<F> CommandListener for F
where
    F: FnMut(Command) -> io::Result<()> + Send,
{
    fn on_command(&mut self, cmd: Command) -> io::Result<()> {
        self(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind() {
        assert_eq!(Command::message("hi").kind(), CommandKind::Message);
        assert_eq!(Command::exit(3).kind(), CommandKind::Exit);
        assert_eq!(Command::Okay.kind(), CommandKind::Okay);
        assert!(Command::exit(0).is_exit());
        assert!(!Command::error("boom").is_exit());
    }

    #[test]
    fn test_event_constructor() {
        assert_eq!(
            Command::event(Some("gc")),
            Command::Event { name: Some("gc".to_string()) }
        );
        assert_eq!(Command::event(None::<String>), Command::Event { name: None });
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::message("hello").to_string(), "hello");
        assert_eq!(Command::exit(2).to_string(), "exit(2)");
        assert_eq!(Command::event(None::<&str>).to_string(), "event *");
    }

    #[test]
    fn test_closure_listener() {
        let mut seen = Vec::new();
        {
            let mut listener = |cmd: Command| -> io::Result<()> {
                seen.push(cmd);
                Ok(())
            };
            listener.on_command(Command::Okay).unwrap();
        }
        assert_eq!(seen, vec![Command::Okay]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_tagging() {
        let json = serde_json::to_string(&Command::exit(1)).unwrap();
        assert_eq!(json, r#"{"type":"exit","code":1}"#);
    }
}
