//! Queue Worker Thread
//!
//! Each queue runs one OS thread that waits on a counting semaphore for
//! work, runs the heartbeat when it is due, and executes queries one at a
//! time in FIFO order until shutdown is requested.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use parking_lot::{Condvar, Mutex};

use super::{DatabaseQueue, QueueError, QueueState};

/// Counting semaphore with a bounded wait
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add one permit and wake a waiter
    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Take a permit, waiting at most `timeout`. Returns false on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            self.available.wait_for(&mut permits, timeout);
        }
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn permits(&self) -> usize {
        *self.permits.lock()
    }
}

impl DatabaseQueue {
    /// Start the queue's thread. Starting an already started queue is a no-op.
    pub fn start_worker(self: &Arc<Self>) -> Result<(), QueueError> {
        if self.is_shutdown_requested() {
            return Err(QueueError::ShuttingDown(self.label()));
        }
        if self.worker_thread_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queue = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(self.label())
            .spawn(move || queue.worker_loop());

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.worker_thread_started.store(false, Ordering::SeqCst);
                log::error!("{}: failed to start worker thread: {}", self.label(), e);
                Err(QueueError::ThreadSpawn(e.to_string()))
            }
        }
    }

    fn worker_loop(&self) {
        log::info!("{}: worker thread started", self.label());

        if self.is_lead_queue() {
            self.run_conductor();
        } else {
            self.initial_connect();
            self.advance_state(QueueState::Running);
        }

        let wait = self.context.config.worker_wait();
        while !self.is_shutdown_requested() {
            if self.heartbeat_due() {
                self.perform_heartbeat();
            }

            if self.work_signal.wait_timeout(wait) {
                if self.is_shutdown_requested() {
                    break;
                }
                self.process_next();
            }
        }

        self.disconnect();
        log::info!("{}: worker thread exiting", self.label());
    }
}
