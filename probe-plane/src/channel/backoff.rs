//! Back-off policies for both ends of the event channel
//!
//! Producers that find the queue full escalate from busy-spinning to yielding
//! to short sleeps, and give up once the channel's deadline has elapsed. The
//! consumer uses a separate idle strategy while the queue is empty.

use std::thread;
use std::time::{Duration, Instant};

/// Producer back-off for a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Rounds of busy-spinning (round `n` spins `2^n` times, capped at 64)
    pub spin_rounds: u32,
    /// Rounds of `thread::yield_now` after spinning
    pub yield_rounds: u32,
    /// Sleep per round once spinning and yielding are exhausted
    pub sleep: Duration,
    /// Wall time after which a command is dropped
    pub deadline: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            spin_rounds: 6,
            yield_rounds: 10,
            sleep: Duration::from_micros(50),
            deadline: Duration::from_millis(1),
        }
    }
}

/// Escalation stage a [`Backoff`] is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPhase {
    Spin,
    Yield,
    Sleep,
}

/// Back-off state for one contended send
///
/// Created only after the first failed push, so the uncontended path never
/// reads the clock.
pub struct Backoff<'a> {
    policy: &'a BackoffPolicy,
    step: u32,
    started: Instant,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a BackoffPolicy) -> Self {
        Self { policy, step: 0, started: Instant::now() }
    }

    pub fn phase(&self) -> BackoffPhase {
        if self.step < self.policy.spin_rounds {
            BackoffPhase::Spin
        } else if self.step < self.policy.spin_rounds.saturating_add(self.policy.yield_rounds) {
            BackoffPhase::Yield
        } else {
            BackoffPhase::Sleep
        }
    }

    /// True once the policy's deadline has elapsed since the first failure
    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.policy.deadline
    }

    /// Wait one round and escalate
    pub fn snooze(&mut self) {
        match self.phase() {
            BackoffPhase::Spin => {
                for _ in 0..(1u32 << self.step.min(6)) {
                    std::hint::spin_loop();
                }
            }
            BackoffPhase::Yield => thread::yield_now(),
            BackoffPhase::Sleep => thread::sleep(self.policy.sleep),
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Consumer idle strategy while the queue is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStrategy {
    /// Idle rounds answered with `thread::yield_now`
    pub yield_rounds: u32,
    /// Further rounds answered with a 1 ms sleep
    pub short_sleep_rounds: u32,
    /// Sleep once both budgets are spent
    pub idle_sleep: Duration,
}

impl Default for WaitStrategy {
    fn default() -> Self {
        Self {
            yield_rounds: 100,
            short_sleep_rounds: 100,
            idle_sleep: Duration::from_millis(10),
        }
    }
}

impl WaitStrategy {
    /// Wait after `round` consecutive empty polls
    pub fn idle(&self, round: u32) {
        if round < self.yield_rounds {
            thread::yield_now();
        } else if round < self.yield_rounds.saturating_add(self.short_sleep_rounds) {
            thread::sleep(Duration::from_millis(1));
        } else {
            thread::sleep(self.idle_sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_escalates() {
        let policy = BackoffPolicy {
            spin_rounds: 2,
            yield_rounds: 2,
            sleep: Duration::from_micros(1),
            deadline: Duration::from_secs(60),
        };
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.phase(), BackoffPhase::Spin);
        backoff.snooze();
        backoff.snooze();
        assert_eq!(backoff.phase(), BackoffPhase::Yield);
        backoff.snooze();
        backoff.snooze();
        assert_eq!(backoff.phase(), BackoffPhase::Sleep);
        assert!(!backoff.expired());
    }

    #[test]
    fn test_backoff_deadline() {
        let policy = BackoffPolicy { deadline: Duration::ZERO, ..BackoffPolicy::default() };
        let backoff = Backoff::new(&policy);
        assert!(backoff.expired());
    }

    #[test]
    fn test_default_deadline_is_one_millisecond() {
        assert_eq!(BackoffPolicy::default().deadline, Duration::from_millis(1));
    }
}
