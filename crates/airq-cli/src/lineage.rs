//! Caller-side request lineage and viewport event debouncing.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One logical stream of requests where each new request cancels the
/// previous one. Tokens are children of `parent`, so cancelling the parent
/// cancels whatever request is in flight. Separate lineages never cancel each
/// other.
#[derive(Debug)]
pub struct RequestLineage {
    parent: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
}

impl RequestLineage {
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            parent,
            current: Mutex::default(),
        }
    }

    /// Cancels the in-flight request, if any, and returns the token for the
    /// next one.
    pub fn supersede(&self) -> CancellationToken {
        let token = self.parent.child_token();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }
}

/// Collapses bursts of events into the last one seen before a quiet period.
#[derive(Debug)]
pub struct Debouncer<T> {
    receiver: mpsc::Receiver<T>,
    quiet: Duration,
}

impl<T> Debouncer<T> {
    pub fn new(receiver: mpsc::Receiver<T>, quiet: Duration) -> Self {
        Self { receiver, quiet }
    }

    /// Next raw event, without waiting for a quiet period. `None` once every
    /// sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next settled event.
    pub async fn next(&mut self) -> Option<T> {
        let first = self.receiver.recv().await?;
        Some(self.settle(first).await)
    }

    /// Keeps replacing `latest` with newer events until none arrives for the
    /// quiet period or the channel closes.
    pub async fn settle(&mut self, mut latest: T) -> T {
        loop {
            match tokio::time::timeout(self.quiet, self.receiver.recv()).await {
                Ok(Some(event)) => latest = event,
                Ok(None) | Err(_) => return latest,
            }
        }
    }
}
