//! Bounded background task queue and cooperative cancellation
//!
//! Side work (RL training passes, exports) runs through a bounded queue with
//! an observable pending count, so tests can await a deterministic flush and
//! a flood of background work exerts backpressure instead of unbounded
//! spawning.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tracing::warn;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct TaskQueue {
    tx: mpsc::Sender<BoxedTask>,
    pending: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl TaskQueue {
    /// Must be created inside a tokio runtime; spawns the single drain task.
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<BoxedTask>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        let drain_pending = Arc::clone(&pending);
        let drain_notify = Arc::clone(&notify);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
                if drain_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    drain_notify.notify_waiters();
                }
            }
        });
        Self {
            tx,
            pending,
            notify,
        }
    }

    /// Enqueue a task; returns false (and drops the task) when the queue is
    /// full or closed.
    pub fn try_spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(Box::pin(task)) {
            Ok(()) => true,
            Err(e) => {
                if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.notify.notify_waiters();
                }
                warn!("background task dropped: {}", e);
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every enqueued task has completed
    pub async fn flush(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Cancels in-flight decision work between stages
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// A token that never fires, for callers without a cancel scope
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_flush_waits_for_enqueued_work() {
        let queue = TaskQueue::new(8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            assert!(queue.try_spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.flush().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let queue = TaskQueue::new(1);
        let gate = Arc::new(Notify::new());
        // first task parks the drain loop
        let parked = Arc::clone(&gate);
        queue.try_spawn(async move {
            parked.notified().await;
        });
        // give the drain task time to pick up the parked task
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.try_spawn(async {}));
        let accepted = queue.try_spawn(async {});
        assert!(!accepted, "queue at capacity must refuse new work");
        gate.notify_waiters();
        queue.flush().await;
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(!CancelToken::never().is_cancelled());
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_returns_immediately() {
        let queue = TaskQueue::new(4);
        queue.flush().await;
    }
}
