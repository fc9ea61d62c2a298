//! Per-thread cancellation tokens.
//!
//! Each producer task gets a `CancelToken`. Cancellation is cooperative:
//! the producer checks the token between agent-loop steps and selects
//! against [`CancelToken::cancelled`] at slow awaits (model stream, tool
//! dispatch); the supervisor's watchdog force-aborts after the grace
//! period if the producer never reaches a checkpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A cancellation token checked and awaited by the producer loop.
#[derive(Clone, Default, Debug)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default, Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested. Safe against the signal
    /// landing between the check and the wait.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Tracks the active cancellation token per thread.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new cancel token for a thread.
    pub fn register(&self, thread_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(thread_id.to_owned(), token.clone());
        token
    }

    /// Cancel a running producer. Returns false when nothing is running.
    pub fn cancel(&self, thread_id: &str) -> bool {
        match self.tokens.lock().get(thread_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token (called when a producer exits).
    pub fn remove(&self, thread_id: &str) {
        self.tokens.lock().remove(thread_id);
    }

    pub fn is_running(&self, thread_id: &str) -> bool {
        self.tokens.lock().contains_key(thread_id)
    }

    /// Cancel everything (shutdown path).
    pub fn cancel_all(&self) {
        for token in self.tokens.lock().values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_signal() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_when_already_set() {
        let token = CancelToken::new();
        token.cancel();
        // Must not hang.
        token.cancelled().await;
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let token = map.register("t1");
        assert!(map.is_running("t1"));

        assert!(map.cancel("t1"));
        assert!(token.is_cancelled());

        map.remove("t1");
        assert!(!map.is_running("t1"));
        assert!(!map.cancel("t1"));
    }

    #[test]
    fn cancel_all_hits_every_thread() {
        let map = CancelMap::new();
        let a = map.register("t1");
        let b = map.register("t2");
        map.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
