// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cancellation tokens and one-shot latches shared by the reactors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Cooperative cancellation signal threaded through every suspending
/// operation.
///
/// Clones share the same signal. Once [`cancel`](CancelToken::cancel) has
/// been called the token stays cancelled forever.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Flag>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that cancels itself after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(timeout: Duration) -> Self {
        let token = Self::new();
        let armed = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            armed.cancel();
        });
        token
    }

    /// Fire the cancellation signal, waking all waiters.
    pub fn cancel(&self) {
        self.inner.set();
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_set()
    }

    /// Suspend until the token is cancelled. Returns immediately if it
    /// already is.
    pub async fn cancelled(&self) {
        self.inner.wait().await;
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Latch
// ---------------------------------------------------------------------------

/// One-shot latch: starts closed, opens exactly once, and every waiter past
/// or future observes the open state.
#[derive(Clone, Default)]
pub struct Latch {
    inner: Arc<Flag>,
}

impl Latch {
    /// Create a closed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch, waking all waiters. Subsequent calls are no-ops.
    pub fn open(&self) {
        self.inner.set();
    }

    /// Whether the latch has been opened.
    pub fn is_open(&self) -> bool {
        self.inner.is_set()
    }

    /// Suspend until the latch opens. Returns immediately if it already has.
    pub async fn wait(&self) {
        self.inner.wait().await;
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("open", &self.is_open()).finish()
    }
}

// ---------------------------------------------------------------------------
// Shared one-shot flag
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Flag {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while !self.is_set() {
            let notified = self.notify.notified();
            // Re-check after registering so a set() between the load and the
            // registration cannot be missed.
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_visible_through_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_wakes_a_pending_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn with_timeout_fires() {
        let token = CancelToken::with_timeout(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn latch_opens_once_for_everyone() {
        let latch = Latch::new();
        assert!(!latch.is_open());

        let waiter = latch.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.open();
        handle.await.unwrap();

        // Late waiters return immediately.
        latch.wait().await;
        assert!(latch.is_open());
    }
}
