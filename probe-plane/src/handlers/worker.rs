//! Single-thread callback worker
//!
//! Threshold notifications arrive on the listener thread; the callbacks they
//! trigger run here, one at a time, so a slow callback never delays the next
//! notification. Shutting the worker down discards jobs that have not started.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Sender};
use log::{debug, warn};

use crate::domain::RuntimeError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Submission side of a [`CallbackWorker`], cheap to clone
#[derive(Clone)]
pub struct WorkerHandle {
    jobs: Sender<Job>,
    cancelled: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Queue `job`; false once the worker has been shut down
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        !self.cancelled.load(Ordering::Acquire) && self.jobs.send(Box::new(job)).is_ok()
    }
}

pub struct CallbackWorker {
    handle: WorkerHandle,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CallbackWorker {
    pub fn spawn(thread_name: String) -> Result<Self, RuntimeError> {
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || loop {
                select! {
                    recv(jobs_rx) -> job => match job {
                        Ok(job) if !flag.load(Ordering::Acquire) => job(),
                        _ => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })
            .map_err(|source| RuntimeError::ThreadSpawn { thread: "callback worker", source })?;
        Ok(Self {
            handle: WorkerHandle { jobs: jobs_tx, cancelled },
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.handle.submit(job)
    }

    /// Stop the worker, discarding pending jobs
    ///
    /// Waits for a running job to finish unless called from that job.
    pub fn shutdown(&mut self) {
        self.handle.cancelled.store(true, Ordering::Release);
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            join_unless_current(thread, "callback worker");
        }
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Join `handle`, unless it is the calling thread
pub(crate) fn join_unless_current(handle: JoinHandle<()>, what: &str) {
    if handle.thread().id() == thread::current().id() {
        debug!("Not joining {what} from its own thread");
        return;
    }
    if handle.join().is_err() {
        warn!("{what} thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order() {
        let worker = CallbackWorker::spawn("test-worker".into()).unwrap();
        let handle = worker.handle();
        let (tx, rx) = unbounded();
        for i in 0..5 {
            let tx = tx.clone();
            assert!(handle.submit(move || tx.send(i).unwrap()));
        }
        let seen: Vec<i32> =
            (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_shutdown_discards_pending_jobs() {
        let mut worker = CallbackWorker::spawn("test-worker".into()).unwrap();
        let (started_tx, started_rx) = bounded(0);
        let (release_tx, release_rx) = bounded::<()>(0);
        let ran = Arc::new(AtomicUsize::new(0));

        worker.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        });
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            worker.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        started_rx.recv().unwrap();
        // Unblock the running job once shutdown has flagged cancellation
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let _ = release_tx.send(());
        });
        worker.shutdown();
        releaser.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!worker.submit(|| {}));
    }

    #[test]
    fn test_shutdown_with_outstanding_handles() {
        let mut worker = CallbackWorker::spawn("test-worker".into()).unwrap();
        let handle = worker.handle();
        worker.shutdown();
        assert!(!handle.submit(|| {}));
    }
}
