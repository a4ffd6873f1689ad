//! Named OS worker threads with bounded join
//!
//! Every pipeline stage (render, packetize, decode, encode) runs on its own
//! thread. Stopping a stage interrupts its blocking wait and then joins with a
//! bound; a thread that does not exit in time is detached.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Join bound used by every stage's terminate path
pub const TERMINATE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

struct DoneOnDrop(Arc<Completion>);

impl Drop for DoneOnDrop {
    fn drop(&mut self) {
        *self.0.done.lock() = true;
        self.0.cond.notify_all();
    }
}

/// Handle to a spawned worker thread
pub struct WorkerThread {
    name: String,
    handle: Option<JoinHandle<()>>,
    completion: Arc<Completion>,
}

impl WorkerThread {
    /// Spawn a named worker
    pub fn spawn<F>(name: &str, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let completion = Arc::new(Completion::default());
        let marker = DoneOnDrop(completion.clone());
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            // Marks completion even if `f` panics
            let _marker = marker;
            f();
        })?;

        debug!("Worker thread '{}' started", name);
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
            completion,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker body has returned
    pub fn is_finished(&self) -> bool {
        *self.completion.done.lock()
    }

    /// Wait up to `timeout` for the worker to finish.
    ///
    /// Returns `true` when the thread was joined. On timeout the thread is
    /// detached and `false` is returned.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let finished = {
            let deadline = Instant::now() + timeout;
            let mut done = self.completion.done.lock();
            while !*done {
                if self.completion.cond.wait_until(&mut done, deadline).timed_out() {
                    break;
                }
            }
            *done
        };

        let Some(handle) = self.handle.take() else {
            return finished;
        };

        if finished {
            if handle.join().is_err() {
                warn!("Worker thread '{}' panicked", self.name);
            }
            debug!("Worker thread '{}' joined", self.name);
            true
        } else {
            warn!(
                "Worker thread '{}' did not stop within {:?}, abandoning it",
                self.name, timeout
            );
            false
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        if self.handle.is_some() && !self.is_finished() {
            debug!("Worker thread '{}' detached", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn joins_finished_worker() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let worker = WorkerThread::spawn("test-worker", move || {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(worker.join_timeout(Duration::from_secs(1)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn abandons_stuck_worker() {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let worker = WorkerThread::spawn("stuck-worker", move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert!(!worker.join_timeout(Duration::from_millis(50)));
        stop.store(true, Ordering::SeqCst);
    }

    #[test]
    fn panicking_worker_still_completes() {
        let worker = WorkerThread::spawn("panic-worker", || panic!("boom")).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(1)));
    }
}
