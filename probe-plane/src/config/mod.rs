//! Runtime configuration
//!
//! The surrounding bootstrap supplies one integer (the outbound queue
//! capacity, overridable through `PROBE_PLANE_CMD_QUEUE_LIMIT`) and the client
//! arguments. Everything else has defaults matching the documented behavior:
//! 100 queued commands, a 1 ms back-off deadline, 32767 speculation ids of
//! 32767 commands each.

pub mod client_args;

pub use client_args::ClientArgs;

use log::debug;
use probe_plane_common::{DEFAULT_QUEUE_CAPACITY, QUEUE_CAPACITY_ENV};

use crate::channel::{BackoffPolicy, WaitStrategy};
use crate::domain::ConfigError;
use crate::speculation::SpeculationLimits;

/// Configuration of one runtime instance
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub client_name: String,
    pub queue_capacity: usize,
    pub args: ClientArgs,
    pub backoff: BackoffPolicy,
    pub wait: WaitStrategy,
    pub speculation: SpeculationLimits,
    /// Stamp `Message` commands with nanoseconds since instance creation
    pub message_timestamps: bool,
}

impl RuntimeConfig {
    /// Defaults, with the queue capacity taken from the environment
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            queue_capacity: queue_capacity_from_env(),
            args: ClientArgs::new(),
            backoff: BackoffPolicy::default(),
            wait: WaitStrategy::default(),
            speculation: SpeculationLimits::default(),
            message_timestamps: false,
        }
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: ClientArgs) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_wait(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn with_speculation(mut self, limits: SpeculationLimits) -> Self {
        self.speculation = limits;
        self
    }

    #[must_use]
    pub fn with_message_timestamps(mut self, enabled: bool) -> Self {
        self.message_timestamps = enabled;
        self
    }

    /// Check the values a caller may have set explicitly
    ///
    /// # Errors
    /// Returns a [`ConfigError`] describing the first invalid setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::EmptyClientName);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.queue_capacity));
        }
        if self.speculation.max_buffered_commands == 0 {
            return Err(ConfigError::InvalidSpeculationLimit {
                name: "max_buffered_commands",
                value: 0,
            });
        }
        Ok(())
    }

    /// Initial instrumentation level from the `level` argument, if it parses
    pub fn instrumentation_level(&self) -> Option<i32> {
        self.args.get("level").and_then(|raw| raw.trim().parse().ok())
    }
}

/// Queue capacity from `PROBE_PLANE_CMD_QUEUE_LIMIT`, or the default
pub fn queue_capacity_from_env() -> usize {
    resolve_queue_capacity(std::env::var(QUEUE_CAPACITY_ENV).ok().as_deref())
}

/// Parse a raw capacity setting, falling back to the default when it is
/// missing, malformed or zero
pub fn resolve_queue_capacity(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_QUEUE_CAPACITY;
    };
    match raw.trim().parse::<usize>() {
        Ok(capacity) if capacity > 0 => {
            debug!("The command queue limit set to {capacity}");
            capacity
        }
        _ => {
            debug!(
                "\"{raw}\" is not a valid queue capacity, using the default of {DEFAULT_QUEUE_CAPACITY}"
            );
            DEFAULT_QUEUE_CAPACITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_queue_capacity() {
        assert_eq!(resolve_queue_capacity(None), 100);
        assert_eq!(resolve_queue_capacity(Some("250")), 250);
        assert_eq!(resolve_queue_capacity(Some(" 64 ")), 64);
        assert_eq!(resolve_queue_capacity(Some("lots")), 100);
        assert_eq!(resolve_queue_capacity(Some("0")), 100);
        assert_eq!(resolve_queue_capacity(Some("-5")), 100);
    }

    #[test]
    fn test_validate() {
        let config = RuntimeConfig::new("client").with_queue_capacity(8);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.clone().with_queue_capacity(0).validate(),
            Err(ConfigError::InvalidCapacity(0))
        );
        assert_eq!(RuntimeConfig::new("  ").validate(), Err(ConfigError::EmptyClientName));
    }

    #[test]
    fn test_instrumentation_level_from_args() {
        let config = RuntimeConfig::new("client")
            .with_args(ClientArgs::from_arg_line(["level=3"]));
        assert_eq!(config.instrumentation_level(), Some(3));
        assert_eq!(RuntimeConfig::new("client").instrumentation_level(), None);
    }
}
