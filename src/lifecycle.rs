//! Inbox lifecycle
//!
//! Each inbox owns a run flag and a close-once stop signal observed by
//! every suspension point in its processing loop. `stop` is idempotent.
//! Lifecycle hooks let the application participate in manager startup
//! and shutdown.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Cloneable handle observing an inbox's stop signal
#[derive(Debug, Clone)]
pub struct StopToken {
    stopped: watch::Receiver<bool>,
}

impl StopToken {
    /// Whether stop has been signalled
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Resolve once stop is signalled; returns immediately if it
    /// already was
    pub async fn stopped(&self) {
        let mut rx = self.stopped.clone();
        if *rx.borrow() {
            return;
        }
        // A closed channel means the lifecycle was dropped; treat it
        // as a stop signal
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Token that never fires; for contexts outside a managed loop
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes
        std::mem::forget(tx);
        Self { stopped: rx }
    }
}

/// Per-inbox run flag plus stop signal
#[derive(Debug)]
pub struct InboxLifecycle {
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Default for InboxLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxLifecycle {
    /// Create a lifecycle in the stopped, not-yet-started state
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            running: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        }
    }

    /// Flip the run flag on
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Flip the run flag off and fire the stop signal; a second call
    /// is a no-op
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    /// Whether the inbox is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !*self.stop_rx.borrow()
    }

    /// A stop token observing this lifecycle
    pub fn stop_token(&self) -> StopToken {
        StopToken {
            stopped: self.stop_rx.clone(),
        }
    }
}

/// Application participation in manager startup and shutdown
///
/// `on_start` failures abort the startup sequence; `on_stop` failures
/// are logged and do not interrupt shutdown. Both receive the stop
/// token and should honor it.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Invoked in registration order before any inbox loop starts
    async fn on_start(&self, token: StopToken) -> anyhow::Result<()>;

    /// Invoked in reverse registration order after the loops drain
    async fn on_stop(&self, token: StopToken) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_start_stop_flags() {
        let lifecycle = InboxLifecycle::new();
        assert!(!lifecycle.is_running());

        lifecycle.start();
        assert!(lifecycle.is_running());
        assert!(!lifecycle.stop_token().is_stopped());

        lifecycle.stop();
        assert!(!lifecycle.is_running());
        assert!(lifecycle.stop_token().is_stopped());

        // Idempotent
        lifecycle.stop();
        assert!(lifecycle.stop_token().is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_future_resolves() {
        let lifecycle = Arc::new(InboxLifecycle::new());
        lifecycle.start();
        let token = lifecycle.stop_token();

        let waiter = tokio::spawn(async move {
            token.stopped().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop signal not observed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_already_stopped_resolves_immediately() {
        let lifecycle = InboxLifecycle::new();
        lifecycle.start();
        lifecycle.stop();

        let token = lifecycle.stop_token();
        tokio::time::timeout(Duration::from_millis(100), token.stopped())
            .await
            .expect("should resolve immediately");
    }
}
