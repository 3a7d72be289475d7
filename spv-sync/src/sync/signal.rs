//! Cross-engine progress signals.
//!
//! A [`TipSignal`] holds the latest tip of one chain. The owning engine publishes
//! after each durable write; other tasks wait on a predicate over the value and
//! select against the shared cancellation token, so no timer-based wakeups are
//! needed to observe shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

#[derive(Debug)]
pub struct TipSignal<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for TipSignal<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone + Send + Sync> TipSignal<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
        }
    }

    /// Replace the tip and wake every waiter.
    pub fn publish(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Wake every waiter without changing the tip, so predicates that read other
    /// state get re-evaluated.
    pub fn notify(&self) {
        self.tx.send_modify(|_| {});
    }

    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Wait until `predicate` holds for the current tip, re-checking on every
    /// publish. Returns [`SyncError::Cancelled`] once `cancel` fires.
    pub async fn wait_for(
        &self,
        cancel: &CancellationToken,
        mut predicate: impl FnMut(&T) -> bool + Send,
    ) -> SyncResult<T> {
        let mut rx = self.tx.subscribe();
        let changed = async move {
            match rx.wait_for(|value| predicate(value)).await {
                Ok(value) => Ok(T::clone(&value)),
                Err(_) => Err(SyncError::Cancelled),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = changed => result,
        }
    }
}
