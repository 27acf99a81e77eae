//! Periodic timer scheduler
//!
//! All timer handlers of an instance share one thread. Due times live in a
//! min-heap; the thread sleeps on a cancel channel until the earliest one, so
//! cancellation wakes it immediately.
//!
//! Firing is fixed-rate: the next due time is the previous due time plus the
//! period. A handler that falls more than one period behind skips the missed
//! runs instead of firing them back to back.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::debug;

use super::descriptor::Callback;
use super::worker::join_unless_current;
use crate::domain::RuntimeError;

/// A timer handler with its period resolved
#[derive(Clone)]
pub struct TimerTask {
    pub name: String,
    pub period: Duration,
    pub callback: Callback,
}

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

pub struct TimerScheduler {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimerScheduler {
    /// Start firing `tasks`; `fire` runs on the scheduler thread for each due task
    ///
    /// Tasks with a zero period must have been filtered out by the caller.
    pub fn spawn<F>(thread_name: String, tasks: Vec<TimerTask>, fire: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&TimerTask) + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let start = Instant::now();
                let mut due: BinaryHeap<Reverse<(Instant, usize)>> = tasks
                    .iter()
                    .enumerate()
                    .map(|(idx, task)| Reverse((start + task.period, idx)))
                    .collect();

                while let Some(&Reverse((next_due, idx))) = due.peek() {
                    let wait = next_due.saturating_duration_since(Instant::now());
                    match cancel_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    due.pop();
                    let task = &tasks[idx];
                    fire(task);

                    let now = Instant::now();
                    let mut next = next_due + task.period;
                    if next <= now {
                        next = now + task.period;
                    }
                    due.push(Reverse((next, idx)));
                }
                debug!("Timer scheduler stopped");
            })
            .map_err(|source| RuntimeError::ThreadSpawn { thread: "timer scheduler", source })?;
        Ok(Self { cancel: Some(cancel_tx), handle: Some(handle) })
    }

    /// Stop firing; waits for an in-flight handler unless called from it
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            join_unless_current(handle, "timer scheduler");
        }
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
