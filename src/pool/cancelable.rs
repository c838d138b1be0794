//! # Cancelable Task Registry
//!
//! Wraps thread pool submission with a shared cancellation flag. Three
//! rules, mirroring the teardown protocol:
//!
//! 1. Tasks queued but not yet started resolve to `Cancelled` without
//!    executing once the flag is set.
//! 2. New submissions while the flag is set fail fast (the closure is
//!    dropped unexecuted, so anything it captured, like an in-progress
//!    gate, is released immediately).
//! 3. Tasks already executing are never interrupted; long-running work
//!    polls [`CancelableTasks::is_cancelled`] cooperatively.
//!
//! The flag is resettable so a storage manager can be reinitialized after
//! `cancel_all_tasks`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::Result;

use super::{TaskHandle, ThreadPool};
use crate::error::StorageError;

/// Shared cancellation state over one or more pools.
#[derive(Debug, Default)]
pub struct CancelableTasks {
    cancelled: Arc<AtomicBool>,
}

impl CancelableTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared flag, for cooperative polling inside long-running work.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sets the flag. Queued-but-unstarted tasks will resolve to
    /// `Cancelled`; running tasks see the flag on their next poll.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Clears the flag, re-enabling submission.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Submits `f` through `pool` under cancellation tracking.
    pub fn execute<T, F>(&self, pool: &ThreadPool, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.is_cancelled() {
            // Fail fast: run a pre-cancelled stub so the handle resolves
            // and `f` (with its captures) is dropped right here.
            return pool.execute(|| {
                Err(eyre::eyre!(StorageError::Cancelled(
                    "task registry is cancelling".into()
                )))
            });
        }

        let flag = Arc::clone(&self.cancelled);
        pool.execute(move || {
            if flag.load(Ordering::Acquire) {
                return Err(eyre::eyre!(StorageError::Cancelled(
                    "task cancelled before start".into()
                )));
            }
            f()
        })
    }
}
