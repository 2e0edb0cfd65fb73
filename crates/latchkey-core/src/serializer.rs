//! Single-concurrency task queue.
//!
//! Operations that read-modify-write identity state (registration steps,
//! signed prekey rotation, contact merges) must never interleave. Each one is
//! submitted to a [`TaskSerializer`]; a task starts only after every task
//! submitted before it has finished, whether it succeeded or failed.
//!
//! Ordering comes from Tokio's fair mutex: waiters acquire it in the order
//! they called `lock`. Futures are lazy, so a task does no work until the
//! serializer polls it.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::Mutex;

/// Errors produced by the serializer itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializerError {
    /// Task exceeded the queue's timeout and was dropped
    #[error("task on queue '{queue}' timed out after {limit:?}")]
    TimedOut {
        /// Queue name
        queue: &'static str,
        /// Configured per-task limit
        limit: Duration,
    },
}

impl SerializerError {
    /// Returns true if resubmitting the task may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// FIFO queue running one task at a time.
///
/// Clones share the queue.
#[derive(Debug, Clone)]
pub struct TaskSerializer {
    name: &'static str,
    gate: Arc<Mutex<()>>,
    timeout: Option<Duration>,
    pending: Arc<AtomicUsize>,
}

impl TaskSerializer {
    /// Queue without a per-task timeout.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self { name, gate: Arc::new(Mutex::new(())), timeout: None, pending: Arc::default() }
    }

    /// Queue that drops tasks running longer than `limit`.
    ///
    /// Only the task future is dropped; external calls it already started are
    /// not cancelled.
    #[must_use]
    pub fn with_timeout(name: &'static str, limit: Duration) -> Self {
        Self { timeout: Some(limit), ..Self::new(name) }
    }

    /// Queue name, used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of tasks queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Run `task` after every previously submitted task has finished.
    ///
    /// # Errors
    ///
    /// - `SerializerError::TimedOut` if the queue has a timeout and the task
    ///   exceeded it; the queue then moves on to the next task
    pub async fn run<F, T>(&self, task: F) -> Result<T, SerializerError>
    where
        F: Future<Output = T>,
    {
        let _pending = PendingGuard::enter(&self.pending);
        let _turn = self.gate.lock().await;

        match self.timeout {
            None => Ok(task.await),
            Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| {
                tracing::warn!(queue = self.name, ?limit, "serialized task timed out");
                SerializerError::TimedOut { queue: self.name, limit }
            }),
        }
    }
}

/// Keeps `pending` accurate even when the caller drops `run` mid-wait.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn tasks_never_overlap() {
        let serializer = TaskSerializer::new("test");
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let serializer = serializer.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                serializer
                    .run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(serializer.pending(), 0);
    }

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let serializer = TaskSerializer::new("test");
        let order = Arc::new(StdMutex::new(Vec::new()));

        let first_gate = serializer.clone();
        let first_order = Arc::clone(&order);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = tokio::spawn(async move {
            first_gate
                .run(async move {
                    started_tx.send(()).unwrap();
                    release_rx.await.unwrap();
                    first_order.lock().unwrap().push(1);
                })
                .await
        });
        started_rx.await.unwrap();

        let second_order = Arc::clone(&order);
        let second_serializer = serializer.clone();
        let second = tokio::spawn(async move {
            second_serializer.run(async move { second_order.lock().unwrap().push(2) }).await
        });
        while serializer.pending() < 2 {
            tokio::task::yield_now().await;
        }

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_task_does_not_block_queue() {
        let serializer = TaskSerializer::new("test");

        let failed: Result<Result<(), &str>, _> = serializer.run(async { Err("boom") }).await;
        assert_eq!(failed, Ok(Err("boom")));

        let next = serializer.run(async { 7 }).await;
        assert_eq!(next, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_task_times_out_and_queue_moves_on() {
        let serializer = TaskSerializer::with_timeout("test", Duration::from_secs(5));

        let slow = serializer.run(tokio::time::sleep(Duration::from_secs(60))).await;
        assert_eq!(
            slow,
            Err(SerializerError::TimedOut { queue: "test", limit: Duration::from_secs(5) })
        );

        assert_eq!(serializer.run(async { "next" }).await, Ok("next"));
    }
}
