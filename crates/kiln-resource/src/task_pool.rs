//! Worker pool for byte I/O and preload callbacks.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_executor::{Executor, Task};

/// A fixed set of worker threads driving one executor.
///
/// Jobs are spawned as futures; the caller polls the returned [`Task`] with
/// [`Task::is_finished`] and collects it with `futures_lite::future::block_on`.
pub struct TaskPool {
    executor: Arc<Executor<'static>>,
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TaskPool {
    /// Start `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let executor = Arc::new(Executor::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let exec = executor.clone();
            let shutdown_flag = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("kiln-loader-{}", i))
                .spawn(move || {
                    while !shutdown_flag.load(Ordering::Relaxed) {
                        if !exec.try_tick() {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                });

            match handle {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        tracing::debug!("TaskPool created with {} threads", num_threads);

        Ok(Self {
            executor,
            threads,
            shutdown,
        })
    }

    /// Spawn a job on the pool.
    pub fn spawn<T>(&self, future: impl Future<Output = T> + Send + 'static) -> Task<T>
    where
        T: Send + 'static,
    {
        self.executor.spawn(future)
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        tracing::debug!("Shutting down TaskPool with {} threads", self.threads.len());
        self.shutdown.store(true, Ordering::Relaxed);

        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("Task pool thread panicked: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threads_is_clamped() {
        let pool = TaskPool::new(0).unwrap();
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn test_spawn_and_collect() {
        let pool = TaskPool::new(2).unwrap();

        let tasks: Vec<_> = (0..10).map(|i| pool.spawn(async move { i * 2 })).collect();
        let results: Vec<_> = tasks.into_iter().map(futures_lite::future::block_on).collect();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }

    #[test]
    fn test_task_finishes_on_worker() {
        let pool = TaskPool::new(1).unwrap();
        let task = pool.spawn(async { thread::current().name().map(str::to_string) });

        while !task.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        let name = futures_lite::future::block_on(task);
        assert_eq!(name.as_deref(), Some("kiln-loader-0"));
    }
}
