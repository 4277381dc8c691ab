//! Ordered release of acquired resources.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type Release = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Entry {
    label: String,
    release: Release,
}

/// A stack of release actions, run newest first.
pub struct ResourceStack {
    entries: Vec<Entry>,
    release_timeout: Duration,
}

impl ResourceStack {
    /// `release_timeout` bounds each individual release action.
    pub fn new(release_timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            release_timeout,
        }
    }

    /// Record how to release a resource that was just acquired.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entries.push(Entry {
            label: label.into(),
            release: Box::new(move || Box::pin(release())),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels in acquisition order.
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    /// Run every release action in reverse acquisition order.
    ///
    /// An action that overruns its timeout is abandoned and logged; the
    /// rest still run.
    pub async fn unwind(&mut self) {
        while let Some(entry) = self.entries.pop() {
            tracing::debug!(resource = %entry.label, "Releasing");
            if tokio::time::timeout(self.release_timeout, (entry.release)())
                .await
                .is_err()
            {
                tracing::warn!(
                    resource = %entry.label,
                    timeout = ?self.release_timeout,
                    "Release timed out; continuing shutdown"
                );
            }
        }
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::warn!(
                remaining = self.entries.len(),
                "Resource stack dropped without unwinding"
            );
        }
    }
}
