//! Shutdown coordination for the gateway.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Coordinator for graceful shutdown.
///
/// Holds the cancellation token every long-running task listens on, and a
/// tracker of those tasks so shutdown can wait for them to finish.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    tasks: TaskTracker,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Token that resolves once shutdown is triggered.
    pub fn subscribe(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger the shutdown signal. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown is triggered.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Spawn a task that shutdown will wait for.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(future)
    }

    /// Number of tracked tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting new tracked tasks and wait for running ones.
    ///
    /// Returns `false` if the grace period elapsed first.
    pub async fn wait_for_tasks(&self, grace: Duration) -> bool {
        self.tasks.close();
        tokio::time::timeout(grace, self.tasks.wait()).await.is_ok()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
