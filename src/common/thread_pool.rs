// Fixed-size worker pool used for parallel link/unlink tasks and chunked
// host copies. Tasks are closures pushed onto a channel; `commit` hands back
// a handle that blocks until the task's result is available.

use std::thread;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use tracing::warn;

use crate::{Result, Status};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one committed task.
pub struct TaskHandle<T> {
    result: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run. Fails if the pool was shut down before
    /// the task executed.
    pub fn join(self) -> Result<T> {
        self.result
            .recv()
            .map_err(|_| Status::Failed("worker pool stopped before task completed".into()))
    }
}

pub struct ThreadPool {
    task_tx: Option<Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(name_prefix: &str, size: usize) -> Self {
        let size = size.max(1);
        let (task_tx, task_rx) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = task_rx.clone();
            let name = format!("{name_prefix}{idx}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn worker {name}: {e}"));
            workers.push(handle);
        }
        Self {
            task_tx: Some(task_tx),
            workers,
        }
    }

    /// Queues a closure and returns a joinable handle for its result.
    pub fn commit<T, F>(&self, func: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let task: Task = Box::new(move || {
            let value = func();
            // Receiver may have been dropped if the caller gave up waiting.
            let _ = result_tx.send(value);
        });
        if let Some(tx) = &self.task_tx {
            if tx.send(task).is_err() {
                warn!("thread pool is shutting down, task dropped");
            }
        }
        TaskHandle { result: result_rx }
    }

    /// Drains outstanding tasks and joins every worker.
    pub fn shutdown(&mut self) {
        self.task_tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = ThreadPool::new("test_pool_", 4);
        let handles: Vec<_> = (0..16).map(|i| pool.commit(move || i * 2)).collect();
        let mut results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..16).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_joins_workers_after_queued_tasks_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new("test_pool_", 2);
        for _ in 0..8 {
            let counter = counter.clone();
            pool.commit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
