//! Trade task queue.
//!
//! A single worker drains tasks in strict FIFO order with a minimum gap
//! between dispatches. Task bodies own their error handling; a panicking
//! task is contained and never takes the worker down.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Minimum time between two task dispatches.
pub const MIN_DISPATCH_GAP: Duration = Duration::from_millis(250);

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    label: String,
    future: TaskFuture,
}

/// Handle for enqueuing work onto the single trade worker.
#[derive(Clone)]
pub struct TradeQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
}

impl TradeQueue {
    /// Create the queue and spawn its worker.
    pub fn start(min_gap: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(worker(rx, min_gap));
        (Self { tx }, handle)
    }

    /// Enqueue a task. Returns false when the worker has shut down.
    pub fn push<F>(&self, label: impl Into<String>, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(QueuedTask {
                label: label.into(),
                future: Box::pin(future),
            })
            .is_ok()
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<QueuedTask>, min_gap: Duration) {
    let mut last_dispatch: Option<Instant> = None;

    while let Some(task) = rx.recv().await {
        if let Some(last) = last_dispatch {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
        last_dispatch = Some(Instant::now());

        debug!(task = %task.label, "Dispatching trade task");
        if let Err(panic) = std::panic::AssertUnwindSafe(task.future)
            .catch_unwind()
            .await
        {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(task = %task.label, %detail, "Trade task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let (queue, _worker) = TradeQueue::start(Duration::from_millis(1));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            queue.push(format!("task-{i}"), async move {
                order.lock().unwrap().push(i);
            });
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_gap_between_dispatches() {
        let (queue, _worker) = TradeQueue::start(MIN_DISPATCH_GAP);
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let count = count.clone();
            queue.push("tick", async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        // After 300 ms only the first two dispatches (t=0, t=250) fit.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_kill_worker() {
        let (queue, _worker) = TradeQueue::start(Duration::from_millis(1));
        let count = Arc::new(AtomicU32::new(0));

        queue.push("boom", async {
            panic!("task failure");
        });
        let c = count.clone();
        queue.push("after", async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
