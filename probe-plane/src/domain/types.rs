//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the different integer identities of the
//! runtime apart: a speculation id can not be passed where an instance id is
//! expected, and thread-local keys can not be confused with either.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of process-unique identities for instances and thread-local keys
static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Runtime instance identity
///
/// Unique for the lifetime of the process, never 0. This is what a thread's
/// reentrancy slot stores, so the slot never owns or borrows the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        InstanceId(next_identity())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RT#{}", self.0)
    }
}

/// Key of a per-thread slot owned by a runtime component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalKey(pub u64);

impl LocalKey {
    pub fn next() -> Self {
        LocalKey(next_identity())
    }
}

/// Speculative buffer handle
///
/// Issued by `SpeculativeBufferManager::begin` from a bounded, monotonically
/// increasing pool. Displayed as the bare number since it is embedded in
/// observer-facing diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeculationId(pub u32);

impl fmt::Display for SpeculationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a runtime instance
///
/// `Created → Started → Running → Exiting → Terminated`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    /// Handlers registered, no callbacks active
    Created = 0,
    /// `start()` in progress
    Started = 1,
    /// Timers, resource listener and event dispatch armed
    Running = 2,
    /// `exit()` teardown in progress
    Exiting = 3,
    /// Teardown finished, delivery thread joined
    Terminated = 4,
}

impl LifecycleState {
    /// Decode the value stored in an `AtomicU8`
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LifecycleState::Created,
            1 => LifecycleState::Started,
            2 => LifecycleState::Running,
            3 => LifecycleState::Exiting,
            _ => LifecycleState::Terminated,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True once `exit()` has begun
    pub fn is_shutting_down(self) -> bool {
        self >= LifecycleState::Exiting
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Started => "started",
            LifecycleState::Running => "running",
            LifecycleState::Exiting => "exiting",
            LifecycleState::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert_ne!(a.0, 0);
        assert!(a.to_string().starts_with("RT#"));
    }

    #[test]
    fn test_speculation_id_display() {
        assert_eq!(SpeculationId(42).to_string(), "42");
    }

    #[test]
    fn test_lifecycle_round_trip() {
        for state in [
            LifecycleState::Created,
            LifecycleState::Started,
            LifecycleState::Running,
            LifecycleState::Exiting,
            LifecycleState::Terminated,
        ] {
            assert_eq!(LifecycleState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_lifecycle_ordering() {
        assert!(!LifecycleState::Running.is_shutting_down());
        assert!(LifecycleState::Exiting.is_shutting_down());
        assert!(LifecycleState::Terminated.is_shutting_down());
        assert_eq!(LifecycleState::Running.to_string(), "running");
    }
}
