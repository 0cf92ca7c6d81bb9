//! Cooperative abort signalling for fetch operations
//!
//! Mirrors the controller/signal split used by fetch APIs: the caller holds
//! an [`AbortController`] and hands cloned [`AbortSignal`]s to individual
//! fetch calls. Aborting is sticky; the first reason wins and later calls
//! are no-ops.

use std::sync::Arc;
use tokio::sync::watch;

/// Owner half of an abort pair. Dropping the controller without calling
/// [`AbortController::abort`] leaves linked signals permanently unaborted.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<Option<Arc<str>>>,
}

/// Signal half handed to fetch operations. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<Arc<str>>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// A new signal linked to this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the abort. Only the first reason is retained.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason: Arc<str> = Arc::from(reason.into());
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Whether the linked controller has fired.
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The abort reason, if the signal has fired.
    pub fn abort_reason(&self) -> Option<String> {
        self.rx.borrow().as_deref().map(str::to_owned)
    }

    /// Resolves with the abort reason once the signal fires. If the
    /// controller is dropped without aborting, this future never resolves.
    pub async fn aborted(&self) -> String {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().as_deref() {
                return reason.to_owned();
            }
            if rx.changed().await.is_err() {
                // Controller gone without firing; park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_starts_unaborted() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());
        assert_eq!(signal.abort_reason(), None);
    }

    #[test]
    fn test_abort_reaches_all_signals() {
        let controller = AbortController::new();
        let a = controller.signal();
        let b = a.clone();
        controller.abort("scrolled away");
        assert!(a.is_aborted());
        assert_eq!(b.abort_reason(), Some("scrolled away".to_string()));
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let controller = AbortController::new();
        let signal = controller.signal();
        controller.abort("first");
        controller.abort("second");
        assert_eq!(signal.abort_reason(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_aborted_future_resolves_on_fire() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = tokio::spawn(async move { signal.aborted().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort("done waiting");
        let reason = waiter.await.unwrap();
        assert_eq!(reason, "done waiting");
    }

    #[tokio::test]
    async fn test_aborted_future_resolves_immediately_when_already_fired() {
        let controller = AbortController::new();
        controller.abort("early");
        let signal = controller.signal();
        assert_eq!(signal.aborted().await, "early");
    }

    #[tokio::test]
    async fn test_dropped_controller_never_resolves() {
        let controller = AbortController::new();
        let signal = controller.signal();
        drop(controller);
        let outcome = tokio::time::timeout(Duration::from_millis(20), signal.aborted()).await;
        assert!(outcome.is_err());
    }
}
