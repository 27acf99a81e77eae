//! # Speculative Buffering
//!
//! Lets a probe emit commands tentatively and decide later whether the
//! observer should ever see them, e.g. keep the last calls leading up to an
//! error and drop them otherwise.
//!
//! ```text
//! begin() ──▶ id ──▶ activate(id) ──▶ send(a), send(b) ──▶ commit(id) ──▶ [a, b] to channel
//!                                                      └──▶ discard(id) ──▶ nothing
//! ```
//!
//! Ids come from a bounded, monotonically increasing pool and are never
//! reused; exhaustion yields `None` and the caller sends directly instead. A
//! committed or discarded id is released, and any later operation on it is an
//! [`SpeculationError::InvalidHandle`].
//!
//! The active buffer is tracked per thread and per manager through a
//! [`ProbeLocal`]. `Exit` commands are never buffered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use probe_plane_common::Command;

use crate::channel::{EventChannel, SendOutcome};
use crate::domain::{SpeculationError, SpeculationId};
use crate::probe_local::ProbeLocal;

/// Maximum number of speculation ids a manager hands out
pub const DEFAULT_MAX_BUFFERS: u32 = i16::MAX as u32;

/// Maximum number of commands a single buffer holds before overflowing
pub const DEFAULT_MAX_BUFFERED_COMMANDS: usize = i16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculationLimits {
    pub max_buffers: u32,
    pub max_buffered_commands: usize,
}

impl Default for SpeculationLimits {
    fn default() -> Self {
        Self {
            max_buffers: DEFAULT_MAX_BUFFERS,
            max_buffered_commands: DEFAULT_MAX_BUFFERED_COMMANDS,
        }
    }
}

#[derive(Default)]
struct SpeculativeBuffer {
    commands: Mutex<Vec<Command>>,
}

impl SpeculativeBuffer {
    /// Append `cmd`; a full buffer is cleared and replaced by one overflow notice
    fn push(&self, id: SpeculationId, cmd: Command, limit: usize) -> bool {
        let mut commands = self.commands.lock();
        if commands.len() >= limit {
            commands.clear();
            commands.push(Command::message(format!("speculative buffer overflow: {id}")));
            return false;
        }
        commands.push(cmd);
        true
    }
}

pub struct SpeculativeBufferManager {
    limits: SpeculationLimits,
    next_id: AtomicU32,
    buffers: RwLock<HashMap<SpeculationId, Arc<SpeculativeBuffer>>>,
    current: ProbeLocal<Option<SpeculationId>>,
    overflows: AtomicU64,
}

impl SpeculativeBufferManager {
    pub fn new(limits: SpeculationLimits) -> Self {
        Self {
            limits,
            next_id: AtomicU32::new(0),
            buffers: RwLock::new(HashMap::new()),
            current: ProbeLocal::new(|| None),
            overflows: AtomicU64::new(0),
        }
    }

    /// Allocate a new buffer, or `None` once the id pool is exhausted
    pub fn begin(&self) -> Option<SpeculationId> {
        let max = self.limits.max_buffers;
        let Ok(raw) = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
        else {
            debug!("Speculation id pool exhausted ({max} ids issued)");
            return None;
        };
        let id = SpeculationId(raw);
        self.buffers.write().insert(id, Arc::new(SpeculativeBuffer::default()));
        Some(id)
    }

    /// Make `id` the calling thread's active buffer
    ///
    /// # Errors
    /// Returns [`SpeculationError::InvalidHandle`] for an unknown or released id
    pub fn activate(&self, id: SpeculationId) -> Result<(), SpeculationError> {
        self.lookup(id)?;
        self.current.set(Some(id));
        Ok(())
    }

    /// Buffer `cmd` if the calling thread has an active buffer
    ///
    /// Hands the command back as `Err` when it was not absorbed (no active
    /// buffer, an `Exit` command, or an active id that has been released
    /// meanwhile), in which case the caller sends it directly.
    pub fn route(&self, cmd: Command) -> Result<(), Command> {
        if cmd.is_exit() {
            return Err(cmd);
        }
        let Some(id) = self.current() else {
            return Err(cmd);
        };
        let Some(buffer) = self.buffers.read().get(&id).cloned() else {
            self.current.reset();
            return Err(cmd);
        };
        if !buffer.push(id, cmd, self.limits.max_buffered_commands) {
            self.overflows.fetch_add(1, Ordering::Relaxed);
            warn!("Speculative buffer {id} overflowed, buffered commands cleared");
        }
        Ok(())
    }

    /// Release `id` and move its commands, in order, into `channel` as one block
    ///
    /// # Errors
    /// Returns [`SpeculationError::InvalidHandle`] for an unknown or released id
    pub fn commit(
        &self,
        id: SpeculationId,
        channel: &EventChannel,
    ) -> Result<SendOutcome, SpeculationError> {
        let buffer = self.release(id)?;
        let commands = std::mem::take(&mut *buffer.commands.lock());
        debug!("Committing speculative buffer {id} ({} commands)", commands.len());
        Ok(channel.send_batch(commands))
    }

    /// Release `id` and drop its commands; returns how many were dropped
    ///
    /// # Errors
    /// Returns [`SpeculationError::InvalidHandle`] for an unknown or released id
    pub fn discard(&self, id: SpeculationId) -> Result<usize, SpeculationError> {
        let buffer = self.release(id)?;
        let discarded = std::mem::take(&mut *buffer.commands.lock()).len();
        debug!("Discarded speculative buffer {id} ({discarded} commands)");
        Ok(discarded)
    }

    /// The calling thread's active buffer
    pub fn current(&self) -> Option<SpeculationId> {
        self.current.peek().flatten()
    }

    /// Number of commands currently held by `id`
    ///
    /// # Errors
    /// Returns [`SpeculationError::InvalidHandle`] for an unknown or released id
    pub fn buffered_len(&self, id: SpeculationId) -> Result<usize, SpeculationError> {
        Ok(self.lookup(id)?.commands.lock().len())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.read().len()
    }

    /// Overflow episodes seen so far
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Drop every buffer; used during runtime teardown
    pub fn clear(&self) {
        self.buffers.write().clear();
        self.current.reset();
    }

    fn lookup(&self, id: SpeculationId) -> Result<Arc<SpeculativeBuffer>, SpeculationError> {
        self.buffers.read().get(&id).cloned().ok_or(SpeculationError::InvalidHandle(id))
    }

    fn release(&self, id: SpeculationId) -> Result<Arc<SpeculativeBuffer>, SpeculationError> {
        let buffer = self.buffers.write().remove(&id).ok_or(SpeculationError::InvalidHandle(id))?;
        self.current.reset();
        Ok(buffer)
    }
}

impl Default for SpeculativeBufferManager {
    fn default() -> Self {
        Self::new(SpeculationLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{bounded, BackoffPolicy, ChannelConsumer};
    use std::io;

    fn drain_all(consumer: ChannelConsumer) -> Vec<Command> {
        let mut seen = Vec::new();
        let mut listener = |cmd: Command| -> io::Result<()> {
            seen.push(cmd);
            Ok(())
        };
        consumer.close(&mut listener);
        seen
    }

    fn send(manager: &SpeculativeBufferManager, channel: &EventChannel, cmd: Command) {
        if let Err(cmd) = manager.route(cmd) {
            channel.send(cmd);
        }
    }

    #[test]
    fn test_commit_preserves_order() {
        let manager = SpeculativeBufferManager::default();
        let (channel, consumer) = bounded(16, BackoffPolicy::default());

        let id = manager.begin().unwrap();
        manager.activate(id).unwrap();
        send(&manager, &channel, Command::message("a"));
        send(&manager, &channel, Command::message("b"));
        assert_eq!(channel.stats().queued, 0);
        assert_eq!(manager.buffered_len(id).unwrap(), 2);

        manager.commit(id, &channel).unwrap();
        assert_eq!(manager.current(), None);
        assert_eq!(drain_all(consumer), vec![Command::message("a"), Command::message("b")]);
    }

    #[test]
    fn test_discard_drops_everything() {
        let manager = SpeculativeBufferManager::default();
        let (channel, consumer) = bounded(16, BackoffPolicy::default());

        let id = manager.begin().unwrap();
        manager.activate(id).unwrap();
        send(&manager, &channel, Command::message("a"));
        send(&manager, &channel, Command::message("b"));
        assert_eq!(manager.discard(id).unwrap(), 2);
        assert_eq!(manager.current(), None);

        send(&manager, &channel, Command::message("direct"));
        assert_eq!(drain_all(consumer), vec![Command::message("direct")]);
    }

    #[test]
    fn test_exit_bypasses_buffer() {
        let manager = SpeculativeBufferManager::default();
        let id = manager.begin().unwrap();
        manager.activate(id).unwrap();
        assert_eq!(manager.route(Command::exit(1)), Err(Command::exit(1)));
        assert_eq!(manager.buffered_len(id).unwrap(), 0);
    }

    #[test]
    fn test_released_id_is_invalid() {
        let manager = SpeculativeBufferManager::default();
        let (channel, _consumer) = bounded(4, BackoffPolicy::default());
        let id = manager.begin().unwrap();
        manager.commit(id, &channel).unwrap();

        let err = SpeculationError::InvalidHandle(id);
        assert_eq!(manager.activate(id), Err(err));
        assert_eq!(manager.discard(id), Err(err));
        assert_eq!(manager.commit(id, &channel), Err(err));
        assert_eq!(manager.activate(SpeculationId(999)), Err(SpeculationError::InvalidHandle(SpeculationId(999))));
    }

    #[test]
    fn test_pool_exhaustion_fails_closed() {
        let manager = SpeculativeBufferManager::new(SpeculationLimits {
            max_buffers: 2,
            max_buffered_commands: 8,
        });
        let first = manager.begin().unwrap();
        let second = manager.begin().unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.begin(), None);

        // Releasing does not return ids to the pool
        manager.discard(first).unwrap();
        assert_eq!(manager.begin(), None);
        assert_eq!(manager.live_buffers(), 1);
    }

    #[test]
    fn test_overflow_clears_and_signals_once_per_episode() {
        let manager = SpeculativeBufferManager::new(SpeculationLimits {
            max_buffers: 4,
            max_buffered_commands: 3,
        });
        let (channel, consumer) = bounded(16, BackoffPolicy::default());
        let id = manager.begin().unwrap();
        manager.activate(id).unwrap();

        for text in ["a", "b", "c", "d", "e", "f"] {
            send(&manager, &channel, Command::message(text));
        }
        assert_eq!(manager.overflow_count(), 1);
        manager.commit(id, &channel).unwrap();

        let overflow = Command::message(format!("speculative buffer overflow: {id}"));
        assert_eq!(
            drain_all(consumer),
            vec![overflow, Command::message("e"), Command::message("f")]
        );
    }

    #[test]
    fn test_active_buffer_is_per_thread() {
        let manager = Arc::new(SpeculativeBufferManager::default());
        let id = manager.begin().unwrap();
        manager.activate(id).unwrap();

        let other = Arc::clone(&manager);
        let absorbed = std::thread::spawn(move || other.route(Command::message("x")).is_ok())
            .join()
            .unwrap();
        assert!(!absorbed);
        assert!(manager.route(Command::message("y")).is_ok());
    }

    #[test]
    fn test_stale_current_falls_through() {
        let manager = Arc::new(SpeculativeBufferManager::default());
        let id = manager.begin().unwrap();
        manager.activate(id).unwrap();

        // Released from another thread: this thread's association goes stale
        let other = Arc::clone(&manager);
        std::thread::spawn(move || other.discard(id).unwrap()).join().unwrap();

        assert_eq!(manager.route(Command::message("z")), Err(Command::message("z")));
        assert_eq!(manager.current(), None);
    }

    #[test]
    fn test_unbuffered_threads_hold_no_local_state() {
        let manager = Arc::new(SpeculativeBufferManager::default());
        let (channel, _consumer) = bounded(16, BackoffPolicy::default());
        let worker = Arc::clone(&manager);
        let slots = std::thread::spawn(move || {
            let before = crate::probe_local::thread_slot_count();
            assert!(worker.route(Command::message("direct")).is_err());
            assert_eq!(worker.current(), None);
            let after_route = crate::probe_local::thread_slot_count() - before;

            let id = worker.begin().unwrap();
            worker.activate(id).unwrap();
            assert!(worker.route(Command::message("held")).is_ok());
            worker.commit(id, &channel).unwrap();
            let after_commit = crate::probe_local::thread_slot_count() - before;
            (after_route, after_commit)
        })
        .join()
        .unwrap();
        assert_eq!(slots, (0, 0));
    }
}
