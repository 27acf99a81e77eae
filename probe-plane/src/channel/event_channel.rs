//! Bounded multi-producer/single-consumer command channel
//!
//! Producers are arbitrary instrumented threads; the consumer is the single
//! delivery thread of a runtime instance. The queue is a lock-free
//! `crossbeam_queue::ArrayQueue` of envelopes: a committed speculative buffer
//! travels as one batch envelope so that it lands contiguously at the
//! observer.
//!
//! A full queue never blocks a traced thread past the policy deadline: the
//! command is dropped and counted, and the consumer announces the loss with a
//! synthesized `Dropped N commands` message before the next real command.
//!
//! A reliable send issued by the delivery thread itself (a listener calling
//! `exit`) can not wait for room only that thread can make. It is parked in a
//! side list that the consumer forwards once the queue runs empty. Nothing is
//! forwarded after an `Exit`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use parking_lot::Mutex;
use probe_plane_common::{Command, CommandListener};
use serde::Serialize;

use super::backoff::{Backoff, BackoffPolicy, WaitStrategy};

/// Unit of queue occupancy
enum Envelope {
    Single(Command),
    Batch(Vec<Command>),
}

impl Envelope {
    fn len(&self) -> usize {
        match self {
            Envelope::Single(_) => 1,
            Envelope::Batch(commands) => commands.len(),
        }
    }
}

enum EnvelopeIter {
    Single(Option<Command>),
    Batch(std::vec::IntoIter<Command>),
}

impl Iterator for EnvelopeIter {
    type Item = Command;

    fn next(&mut self) -> Option<Command> {
        match self {
            EnvelopeIter::Single(cmd) => cmd.take(),
            EnvelopeIter::Batch(commands) => commands.next(),
        }
    }
}

impl IntoIterator for Envelope {
    type Item = Command;
    type IntoIter = EnvelopeIter;

    fn into_iter(self) -> EnvelopeIter {
        match self {
            Envelope::Single(cmd) => EnvelopeIter::Single(Some(cmd)),
            Envelope::Batch(commands) => EnvelopeIter::Batch(commands.into_iter()),
        }
    }
}

/// Result of a send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    /// Back-off deadline exceeded; counted towards the next drop notice
    Dropped,
    /// The consumer side has been closed
    Closed,
    /// Absorbed by the sending thread's active speculative buffer
    Buffered,
}

/// Why a drain loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    /// An `Exit` command was forwarded
    ExitDelivered,
    /// The keep-running condition failed or a stop was requested
    Stopped,
}

/// Snapshot of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub capacity: usize,
    pub queued: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped_total: u64,
    pub pending_drops: u64,
}

struct Shared {
    queue: ArrayQueue<Envelope>,
    policy: BackoffPolicy,
    /// Drops not yet announced to the observer
    dropped: AtomicU64,
    dropped_total: AtomicU64,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    closed: AtomicBool,
    stop: AtomicBool,
    /// Reliable sends the consumer thread made while the queue was full
    deferred: Mutex<VecDeque<Envelope>>,
    consumer_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn on_consumer_thread(&self) -> bool {
        *self.consumer_thread.lock() == Some(thread::current().id())
    }

    /// Next envelope; deferred ones only once the queue is empty
    fn pop(&self) -> Option<Envelope> {
        self.queue.pop().or_else(|| self.deferred.lock().pop_front())
    }
}

/// Producer handle; cheap to clone and share across threads
#[derive(Clone)]
pub struct EventChannel {
    shared: Arc<Shared>,
}

/// The single consumer of an [`EventChannel`]
///
/// Deliberately not `Clone`: owning this value is what makes a thread the
/// delivery thread. Dropping it closes the channel.
pub struct ChannelConsumer {
    shared: Arc<Shared>,
    exit_delivered: bool,
}

/// Create a channel holding at most `capacity` envelopes
pub fn bounded(capacity: usize, policy: BackoffPolicy) -> (EventChannel, ChannelConsumer) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity.max(1)),
        policy,
        dropped: AtomicU64::new(0),
        dropped_total: AtomicU64::new(0),
        enqueued: AtomicU64::new(0),
        delivered: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        stop: AtomicBool::new(false),
        deferred: Mutex::new(VecDeque::new()),
        consumer_thread: Mutex::new(None),
    });
    (EventChannel { shared: Arc::clone(&shared) }, ChannelConsumer { shared, exit_delivered: false })
}

impl EventChannel {
    /// Enqueue `cmd`, backing off up to the policy deadline on a full queue
    pub fn send(&self, cmd: Command) -> SendOutcome {
        self.push(Envelope::Single(cmd), false)
    }

    /// Enqueue `cmd` ignoring the deadline; returns only once it is queued or
    /// the channel is closed
    ///
    /// Used for `Exit`, which must never be dropped. Called on the delivery
    /// thread with the queue full, the command is deferred instead of waited
    /// on.
    pub fn send_reliable(&self, cmd: Command) -> SendOutcome {
        self.push(Envelope::Single(cmd), true)
    }

    /// Enqueue `commands` as one contiguous block
    ///
    /// The whole batch occupies a single queue slot; if it is dropped, every
    /// command in it is counted.
    pub fn send_batch(&self, commands: Vec<Command>) -> SendOutcome {
        if commands.is_empty() {
            return SendOutcome::Enqueued;
        }
        self.push(Envelope::Batch(commands), false)
    }

    fn push(&self, envelope: Envelope, reliable: bool) -> SendOutcome {
        let shared = &*self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        let count = envelope.len() as u64;

        let mut envelope = match shared.queue.push(envelope) {
            Ok(()) => {
                shared.enqueued.fetch_add(count, Ordering::Relaxed);
                return SendOutcome::Enqueued;
            }
            Err(rejected) => rejected,
        };

        if reliable && shared.on_consumer_thread() {
            debug!("Queue full on the delivery thread, deferring reliable send");
            shared.deferred.lock().push_back(envelope);
            shared.enqueued.fetch_add(count, Ordering::Relaxed);
            return SendOutcome::Enqueued;
        }

        let mut backoff = Backoff::new(&shared.policy);
        loop {
            if shared.closed.load(Ordering::Acquire) {
                return SendOutcome::Closed;
            }
            if !reliable && backoff.expired() {
                shared.dropped.fetch_add(count, Ordering::AcqRel);
                shared.dropped_total.fetch_add(count, Ordering::Relaxed);
                return SendOutcome::Dropped;
            }
            backoff.snooze();
            envelope = match shared.queue.push(envelope) {
                Ok(()) => {
                    shared.enqueued.fetch_add(count, Ordering::Relaxed);
                    return SendOutcome::Enqueued;
                }
                Err(rejected) => rejected,
            };
        }
    }

    /// Ask the drain loop to return after its current command
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.queue.capacity()
    }

    pub fn stats(&self) -> ChannelStats {
        let shared = &*self.shared;
        ChannelStats {
            capacity: shared.queue.capacity(),
            queued: shared.queue.len(),
            enqueued: shared.enqueued.load(Ordering::Relaxed),
            delivered: shared.delivered.load(Ordering::Relaxed),
            dropped_total: shared.dropped_total.load(Ordering::Relaxed),
            pending_drops: shared.dropped.load(Ordering::Relaxed),
        }
    }
}

impl ChannelConsumer {
    /// Forward queued commands to `listener` until an `Exit` has been
    /// delivered, `keep_running` returns false, or a stop is requested
    pub fn drain<L>(
        &mut self,
        listener: &mut L,
        wait: &WaitStrategy,
        keep_running: impl Fn() -> bool,
    ) -> DrainExit
    where
        L: CommandListener + ?Sized,
    {
        self.claim_thread();
        if self.exit_delivered {
            return DrainExit::ExitDelivered;
        }
        let mut idle_rounds = 0u32;
        while keep_running() && !self.shared.stop.load(Ordering::Acquire) {
            match self.shared.pop() {
                Some(envelope) => {
                    idle_rounds = 0;
                    for cmd in envelope {
                        let is_exit = cmd.is_exit();
                        self.deliver(listener, cmd);
                        if is_exit {
                            debug!("Exit command delivered, stopping drain");
                            self.exit_delivered = true;
                            return DrainExit::ExitDelivered;
                        }
                    }
                }
                None => {
                    wait.idle(idle_rounds);
                    idle_rounds = idle_rounds.saturating_add(1);
                }
            }
        }
        DrainExit::Stopped
    }

    /// Close the channel and forward whatever is still queued, up to and
    /// including an `Exit`
    ///
    /// Returns the number of commands forwarded, including a final drop
    /// notice if one was pending. Commands queued behind an `Exit` that has
    /// been forwarded are discarded.
    pub fn close<L>(mut self, listener: &mut L) -> usize
    where
        L: CommandListener + ?Sized,
    {
        self.claim_thread();
        self.shared.closed.store(true, Ordering::Release);
        let mut forwarded = 0;
        let mut discarded = 0u64;
        while let Some(envelope) = self.shared.pop() {
            for cmd in envelope {
                if self.exit_delivered {
                    discarded += 1;
                    continue;
                }
                self.exit_delivered = cmd.is_exit();
                forwarded += self.deliver(listener, cmd);
            }
        }
        if self.exit_delivered {
            discarded += self.shared.dropped.swap(0, Ordering::AcqRel);
        } else {
            forwarded += self.flush_dropped(listener);
        }
        if discarded > 0 {
            debug!("Discarded {discarded} commands sent after exit");
        }
        forwarded
    }

    /// Mark the calling thread as the one delivering
    fn claim_thread(&self) {
        *self.shared.consumer_thread.lock() = Some(thread::current().id());
    }

    /// Forward `cmd`, preceded by a drop notice when drops are pending
    fn deliver<L>(&self, listener: &mut L, cmd: Command) -> usize
    where
        L: CommandListener + ?Sized,
    {
        let notices = self.flush_dropped(listener);
        self.forward(listener, cmd);
        notices + 1
    }

    fn flush_dropped<L>(&self, listener: &mut L) -> usize
    where
        L: CommandListener + ?Sized,
    {
        let dropped = self.shared.dropped.swap(0, Ordering::AcqRel);
        if dropped == 0 {
            return 0;
        }
        self.forward(listener, Command::message(format!("Dropped {dropped} commands")));
        1
    }

    fn forward<L>(&self, listener: &mut L, cmd: Command)
    where
        L: CommandListener + ?Sized,
    {
        let kind = cmd.kind();
        match catch_unwind(AssertUnwindSafe(|| listener.on_command(cmd))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Command listener failed on {kind:?}: {e}"),
            Err(_) => warn!("Command listener panicked on {kind:?}"),
        }
        self.shared.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ChannelConsumer {
    fn drop(&mut self) {
        // Reliable senders spin until this flips
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::thread;
    use std::time::Duration;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            spin_rounds: 1,
            yield_rounds: 1,
            sleep: Duration::from_micros(10),
            deadline: Duration::from_micros(200),
        }
    }

    fn collect(consumer: ChannelConsumer) -> Vec<Command> {
        let mut seen = Vec::new();
        let mut listener = |cmd: Command| -> io::Result<()> {
            seen.push(cmd);
            Ok(())
        };
        consumer.close(&mut listener);
        seen
    }

    #[test]
    fn test_fifo_single_producer() {
        let (channel, consumer) = bounded(8, fast_policy());
        for i in 0..5 {
            assert_eq!(channel.send(Command::message(format!("m{i}"))), SendOutcome::Enqueued);
        }
        let seen = collect(consumer);
        let texts: Vec<String> = seen.iter().map(ToString::to_string).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_full_queue_drops_and_announces() {
        let (channel, consumer) = bounded(2, fast_policy());
        assert_eq!(channel.send(Command::message("a")), SendOutcome::Enqueued);
        assert_eq!(channel.send(Command::message("b")), SendOutcome::Enqueued);
        assert_eq!(channel.send(Command::message("c")), SendOutcome::Dropped);
        assert_eq!(channel.send(Command::message("d")), SendOutcome::Dropped);
        assert_eq!(channel.stats().pending_drops, 2);

        let seen = collect(consumer);
        assert_eq!(
            seen,
            vec![
                Command::message("Dropped 2 commands"),
                Command::message("a"),
                Command::message("b"),
            ]
        );
    }

    #[test]
    fn test_batch_is_contiguous_and_counts_as_one_slot() {
        let (channel, consumer) = bounded(2, fast_policy());
        channel.send(Command::message("before"));
        let batch = vec![Command::message("s1"), Command::message("s2"), Command::message("s3")];
        assert_eq!(channel.send_batch(batch), SendOutcome::Enqueued);
        let seen = collect(consumer);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[1], Command::message("s1"));
        assert_eq!(seen[3], Command::message("s3"));
    }

    #[test]
    fn test_dropped_batch_counts_every_command() {
        let (channel, consumer) = bounded(1, fast_policy());
        channel.send(Command::message("fill"));
        let batch = vec![Command::message("x"), Command::message("y")];
        assert_eq!(channel.send_batch(batch), SendOutcome::Dropped);
        let seen = collect(consumer);
        assert_eq!(seen[0], Command::message("Dropped 2 commands"));
    }

    #[test]
    fn test_send_after_close_is_refused() {
        let (channel, consumer) = bounded(4, fast_policy());
        drop(consumer);
        assert!(channel.is_closed());
        assert_eq!(channel.send(Command::Okay), SendOutcome::Closed);
        assert_eq!(channel.send_reliable(Command::exit(0)), SendOutcome::Closed);
    }

    #[test]
    fn test_drain_stops_after_exit() {
        let (channel, mut consumer) = bounded(8, fast_policy());
        channel.send(Command::message("last words"));
        channel.send_reliable(Command::exit(3));
        channel.send(Command::message("after exit"));

        let mut seen = Vec::new();
        let mut listener = |cmd: Command| -> io::Result<()> {
            seen.push(cmd);
            Ok(())
        };
        let exit = consumer.drain(&mut listener, &WaitStrategy::default(), || true);
        assert_eq!(exit, DrainExit::ExitDelivered);
        assert_eq!(seen, vec![Command::message("last words"), Command::exit(3)]);
        assert_eq!(channel.stats().queued, 1);
    }

    #[test]
    fn test_close_stops_at_exit() {
        let (channel, consumer) = bounded(8, fast_policy());
        channel.send(Command::message("a"));
        channel.send_reliable(Command::exit(0));
        channel.send(Command::message("late"));
        assert_eq!(collect(consumer), vec![Command::message("a"), Command::exit(0)]);
    }

    #[test]
    fn test_close_after_drained_exit_forwards_nothing() {
        let (channel, mut consumer) = bounded(2, fast_policy());
        channel.send_reliable(Command::exit(1));
        channel.send(Command::message("late"));

        let mut seen = Vec::new();
        let mut listener = |cmd: Command| -> io::Result<()> {
            seen.push(cmd);
            Ok(())
        };
        assert_eq!(consumer.drain(&mut listener, &WaitStrategy::default(), || true), DrainExit::ExitDelivered);
        assert_eq!(channel.send(Command::message("later")), SendOutcome::Enqueued);
        assert_eq!(channel.send(Command::message("dropped")), SendOutcome::Dropped);
        assert_eq!(consumer.close(&mut listener), 0);
        assert_eq!(seen, vec![Command::exit(1)]);
    }

    #[test]
    fn test_reliable_send_from_delivery_thread_is_deferred() {
        let (channel, mut consumer) = bounded(1, fast_policy());
        channel.send(Command::message("first"));

        let producer = channel.clone();
        let mut seen = Vec::new();
        let mut listener = |cmd: Command| -> io::Result<()> {
            if cmd == Command::message("first") {
                assert_eq!(producer.send(Command::message("second")), SendOutcome::Enqueued);
                // Queue is full again and only this thread drains it
                assert_eq!(producer.send_reliable(Command::exit(5)), SendOutcome::Enqueued);
            }
            seen.push(cmd);
            Ok(())
        };
        let exit = consumer.drain(&mut listener, &WaitStrategy::default(), || true);
        assert_eq!(exit, DrainExit::ExitDelivered);
        assert_eq!(
            seen,
            vec![Command::message("first"), Command::message("second"), Command::exit(5)]
        );
    }

    #[test]
    fn test_listener_failure_does_not_stop_delivery() {
        let (channel, consumer) = bounded(4, fast_policy());
        channel.send(Command::message("fails"));
        channel.send(Command::message("arrives"));
        let mut seen = Vec::new();
        let mut listener = |cmd: Command| -> io::Result<()> {
            if cmd == Command::message("fails") {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "observer gone"));
            }
            seen.push(cmd);
            Ok(())
        };
        assert_eq!(consumer.close(&mut listener), 2);
        assert_eq!(seen, vec![Command::message("arrives")]);
    }

    #[test]
    fn test_request_stop_ends_idle_drain() {
        let (channel, mut consumer) = bounded(4, fast_policy());
        let handle = thread::spawn(move || {
            let mut listener = |_cmd: Command| -> io::Result<()> { Ok(()) };
            consumer.drain(&mut listener, &WaitStrategy::default(), || true)
        });
        thread::sleep(Duration::from_millis(20));
        channel.request_stop();
        assert_eq!(handle.join().unwrap(), DrainExit::Stopped);
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order() {
        let (channel, mut consumer) = bounded(
            16,
            BackoffPolicy { deadline: Duration::from_secs(5), ..BackoffPolicy::default() },
        );
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        channel.send(Command::message(format!("{p}:{i}")));
                    }
                })
            })
            .collect();

        let closer = channel.clone();
        let consumer_thread = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut listener = |cmd: Command| -> io::Result<()> {
                seen.push(cmd.to_string());
                Ok(())
            };
            consumer.drain(&mut listener, &WaitStrategy::default(), || true);
            consumer.close(&mut listener);
            seen
        });

        for producer in producers {
            producer.join().unwrap();
        }
        closer.send_reliable(Command::exit(0));
        let seen = consumer_thread.join().unwrap();

        let mut next = [0u32; 4];
        for text in seen.iter().filter(|t| t.contains(':')) {
            let (p, i) = text.split_once(':').unwrap();
            let p: usize = p.parse().unwrap();
            let i: u32 = i.parse().unwrap();
            assert_eq!(i, next[p], "producer {p} delivered out of order");
            next[p] += 1;
        }
        assert_eq!(next, [200; 4]);
    }
}
