//! Process-wide shutdown signal
//!
//! OS signals and fatal persistence errors both trip the same signal; the
//! scheduler stops admitting identities and the queues drain before exit.

use std::sync::Arc;
use tokio::sync::watch;

/// Why the harvest is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,

    /// An unrecoverable error, e.g. a batch that exhausted its insert attempts
    Fatal(String),
}

/// Cloneable handle to the shutdown state
///
/// Only the first reason is kept.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Trips the signal; returns false if it was already tripped
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let triggered = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });

        if triggered {
            match &reason {
                ShutdownReason::Signal => tracing::info!("Shutdown requested"),
                ShutdownReason::Fatal(message) => {
                    tracing::error!("Fatal error, shutting down: {}", message)
                }
            }
        }

        triggered
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.tx.borrow().clone()
    }

    /// Returns true if the shutdown was caused by a fatal error
    pub fn is_fatal(&self) -> bool {
        matches!(self.reason(), Some(ShutdownReason::Fatal(_)))
    }

    /// Resolves once the signal has been tripped
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        assert!(signal.trigger(ShutdownReason::Fatal("insert failed".to_string())));
        assert!(!signal.trigger(ShutdownReason::Signal));

        assert!(signal.is_triggered());
        assert!(signal.is_fatal());
        assert_eq!(
            signal.reason(),
            Some(ShutdownReason::Fatal("insert failed".to_string()))
        );
    }

    #[test]
    fn test_clones_share_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.trigger(ShutdownReason::Signal);
        assert!(signal.is_triggered());
        assert!(!signal.is_fatal());
    }

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::task::yield_now().await;
        signal.trigger(ShutdownReason::Signal);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger(ShutdownReason::Signal);
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .unwrap();
    }
}
