//! # Thread Pool
//!
//! A fixed-size pool of worker threads executing submitted closures in FIFO
//! order. Three instances run inside the storage manager (async, reader,
//! writer), kept separate so reader saturation cannot starve async
//! submission.
//!
//! The queue is unbounded: a closure running on a worker may itself submit
//! to the same pool without risk of deadlock, because enqueueing never
//! blocks on queue capacity. No work stealing; one global queue, one
//! condvar.
//!
//! ## Handles
//!
//! `execute` returns a [`TaskHandle`] immediately. `TaskHandle::wait`
//! blocks for the closure's `Result` and consumes the handle, so a result
//! is observed exactly once. Dropping a handle without waiting detaches
//! the task (it still runs).
//!
//! ## Shutdown
//!
//! `shutdown` drains everything already queued, then joins the workers.
//! Submissions racing with shutdown resolve to `Cancelled` instead of
//! enqueueing. The pool also shuts down on drop.

pub mod cancelable;

pub use cancelable::CancelableTasks;

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::error::StorageError;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    cond: Condvar,
}

/// Fixed-size FIFO worker pool.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
}

impl ThreadPool {
    /// Creates a pool with `concurrency` workers; 0 selects the hardware
    /// concurrency.
    pub fn new(concurrency: usize, name: &str) -> Self {
        let concurrency = if concurrency == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            concurrency
        };

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let workers = (0..concurrency)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("tessera-{name}-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawning pool worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Enqueues a closure and returns its handle. If the pool is already
    /// shut down, the handle resolves to `Cancelled` without running the
    /// closure.
    pub fn execute<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let state = Arc::new(TaskState::new());
        let task_state = Arc::clone(&state);

        let job: Job = Box::new(move || {
            task_state.fulfill(f());
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                drop(queue);
                // The job box is dropped here, releasing anything the
                // closure captured (e.g. in-progress gates).
                state.fulfill(Err(eyre::eyre!(StorageError::Cancelled(
                    "thread pool is shut down".into()
                ))));
                return TaskHandle { state };
            }
            queue.jobs.push_back(job);
        }
        self.shared.cond.notify_one();

        TaskHandle { state }
    }

    /// Drains all queued work and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.cond.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.cond.wait(&mut queue);
            }
        };
        job();
    }
}

struct TaskState<T> {
    result: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

impl<T> TaskState<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn fulfill(&self, result: Result<T>) {
        let mut slot = self.result.lock();
        debug_assert!(slot.is_none(), "task fulfilled twice");
        *slot = Some(result);
        self.cond.notify_all();
    }
}

/// Waitable handle to a submitted task.
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task completes and returns its result.
    pub fn wait(self) -> Result<T> {
        let mut slot = self.state.result.lock();
        while slot.is_none() {
            self.state.cond.wait(&mut slot);
        }
        slot.take().expect("result present after wait")
    }

    /// Non-blocking completion probe.
    pub fn is_done(&self) -> bool {
        self.state.result.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn executes_and_returns_results() {
        let pool = ThreadPool::new(2, "test");
        let handles: Vec<_> = (0..8).map(|i| pool.execute(move || Ok(i * 2))).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn errors_propagate_through_wait() {
        let pool = ThreadPool::new(1, "test");
        let handle = pool.execute(|| -> Result<()> { eyre::bail!("boom") });
        assert!(handle.wait().is_err());
    }

    #[test]
    fn fifo_on_single_worker() {
        let pool = ThreadPool::new(1, "test");
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.execute(move || {
                    order.lock().push(i);
                    Ok(())
                })
            })
            .collect();
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn submission_from_worker_does_not_deadlock() {
        let pool = Arc::new(ThreadPool::new(1, "test"));
        let inner_pool = Arc::clone(&pool);
        let outer = pool.execute(move || {
            // The single worker is busy right now; the nested task can only
            // run after this closure returns. Waiting on it here would
            // deadlock, so enqueue and detach.
            let inner = inner_pool.execute(|| Ok(41));
            drop(inner);
            Ok(1)
        });
        assert_eq!(outer.wait().unwrap(), 1);
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let pool = ThreadPool::new(2, "test");
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        for h in handles {
            h.wait().unwrap();
        }
    }

    #[test]
    fn submit_after_shutdown_is_cancelled() {
        let pool = ThreadPool::new(1, "test");
        pool.shutdown();
        let err = pool.execute(|| Ok(())).wait().unwrap_err();
        assert!(crate::error::is_storage_error(
            &err,
            &StorageError::Cancelled(String::new())
        ));
    }

    #[test]
    fn zero_concurrency_resolves_to_hardware() {
        let pool = ThreadPool::new(0, "test");
        assert!(pool.concurrency() >= 1);
    }
}
