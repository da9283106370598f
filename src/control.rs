//! Shared exit intent for one job
//!
//! The cancel path, the disk-full path, the readiness watcher and the exit
//! handler all look at the same cell. The first intent written wins; every
//! later write is a no-op, which makes repeated cancellation idempotent.

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::ExitIntent;

#[derive(Debug, Clone)]
pub struct JobControl {
    intent: Arc<watch::Sender<ExitIntent>>,
}

impl JobControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ExitIntent::None);
        Self {
            intent: Arc::new(tx),
        }
    }

    pub fn intent(&self) -> ExitIntent {
        *self.intent.borrow()
    }

    pub fn is_set(&self) -> bool {
        self.intent() != ExitIntent::None
    }

    /// Returns `true` only for the call that actually recorded the request.
    pub fn request_cancel(&self) -> bool {
        self.record(ExitIntent::CancelRequested)
    }

    pub fn observe_disk_full(&self) -> bool {
        self.record(ExitIntent::DiskFullObserved)
    }

    fn record(&self, intent: ExitIntent) -> bool {
        self.intent.send_if_modified(|current| {
            if *current == ExitIntent::None {
                *current = intent;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once any intent has been recorded.
    pub async fn wait(&self) -> ExitIntent {
        let mut rx = self.intent.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != ExitIntent::None {
                return current;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this is unreachable in practice.
                return std::future::pending().await;
            }
        }
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_clear() {
        let control = JobControl::new();
        assert_eq!(control.intent(), ExitIntent::None);
        assert!(!control.is_set());
    }

    #[test]
    fn test_second_cancel_is_noop() {
        let control = JobControl::new();
        assert!(control.request_cancel());
        assert!(!control.request_cancel());
        assert_eq!(control.intent(), ExitIntent::CancelRequested);
    }

    #[test]
    fn test_first_intent_wins() {
        let control = JobControl::new();
        assert!(control.observe_disk_full());
        assert!(!control.request_cancel());
        assert_eq!(control.intent(), ExitIntent::DiskFullObserved);
    }

    #[test]
    fn test_clones_share_state() {
        let control = JobControl::new();
        let clone = control.clone();
        control.request_cancel();
        assert!(clone.is_set());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_cancel() {
        let control = JobControl::new();
        let waiter = control.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        control.request_cancel();
        assert_eq!(task.await.unwrap(), ExitIntent::CancelRequested);
    }
}
