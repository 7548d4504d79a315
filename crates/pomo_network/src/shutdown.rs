//! Hierarchical shutdown signals for background tasks.
//!
//! Every long-running loop selects on [`Shutdown::cancelled`]. A signal made
//! with [`Shutdown::child`] fires when either it or any of its ancestors is
//! triggered; triggering a child leaves the parent untouched.

use std::sync::Arc;

use futures::future::select_all;
use tokio::sync::watch;

/// A cloneable, cancellable shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    parent: Option<Box<Shutdown>>,
}

impl Shutdown {
    /// Create a root signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: None,
        }
    }

    /// Derive a child signal that is also cancelled when `self` is.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Fire this signal (and therefore every child derived from it).
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether this signal or one of its ancestors has fired.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_triggered())
    }

    /// Resolve once this signal or one of its ancestors fires.
    pub async fn cancelled(&self) {
        let mut receivers = Vec::new();
        let mut current = Some(self);
        while let Some(signal) = current {
            receivers.push(signal.tx.subscribe());
            current = signal.parent.as_deref();
        }

        let waits = receivers.into_iter().map(|mut rx| {
            Box::pin(async move {
                loop {
                    let fired = *rx.borrow_and_update();
                    if fired || rx.changed().await.is_err() {
                        break;
                    }
                }
            })
        });
        select_all(waits).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_resolves_cancelled() {
        let signal = Shutdown::new();
        assert!(!signal.is_triggered());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let parent = Shutdown::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.trigger();
        assert!(child.is_triggered());
        assert!(grandchild.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), grandchild.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_does_not_cancel_parent() {
        let parent = Shutdown::new();
        let child = parent.child();

        child.trigger();
        assert!(child.is_triggered());
        assert!(!parent.is_triggered());

        let pending = tokio::time::timeout(Duration::from_millis(50), parent.cancelled()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger_returns_immediately() {
        let signal = Shutdown::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
    }
}
