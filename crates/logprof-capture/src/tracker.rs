//! Counting live half-stream workers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

/// Tracks spawned workers so the decode stage can wait for all of them to
/// drain before closing the conjoiner's inputs
#[derive(Debug, Clone, Default)]
pub struct WorkerTracker {
    inner: Arc<Inner>,
}

/// Held by a running worker; dropping it marks the worker finished
#[derive(Debug)]
pub struct WorkerGuard {
    inner: Arc<Inner>,
}

impl WorkerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> WorkerGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        WorkerGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolve once no worker is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent drop is not missed
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
