//! Cooperative cancellation signal shared by an execution and its stages.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// A one-shot cancellation signal carrying a reason.
///
/// Only the first reason is kept. Stages either check
/// [`CancellationToken::is_cancelled`] between units of work or `select!` on
/// [`CancellationToken::cancelled`] around a long await.
#[derive(Default)]
pub struct CancellationToken {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an uncancelled token behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Signals cancellation. Returns false if the token was already cancelled,
    /// in which case `reason` is dropped.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.reason.lock();
        if self.flag.load(Ordering::SeqCst) {
            return false;
        }
        let reason = reason.into();
        debug!(reason = %reason, "Cancellation requested");
        *slot = Some(reason);
        self.flag.store(true, Ordering::SeqCst);
        drop(slot);

        self.notify.notify_waiters();
        true
    }

    /// Whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The reason given to the first [`Self::cancel`].
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves once the token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);

        assert!(token.cancel("user abort"));
        assert!(!token.cancel("timeout"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("user abort"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_wake_on_cancel() {
        let token = CancellationToken::shared();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = Arc::clone(&token);
                tokio::spawn(async move {
                    token.cancelled().await;
                    token.reason()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("paused");

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().as_deref(), Some("paused"));
        }
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_after_cancel() {
        let token = CancellationToken::new();
        token.cancel("early");
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }
}
