// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative stop signal shared by supervisor tasks.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;

/// Cooperative stop token.
///
/// Cloneable and backed by an `Arc`; signalling any clone wakes all waiters.
/// Signalled-then-wait returns immediately, so late subscribers never hang.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopToken {
    /// Create a new, unsignalled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal stop to all waiters.
    pub fn signal(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns `true` once stop has been signalled.
    pub fn is_signalled(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait until stop is signalled.
    pub async fn wait(&self) {
        while !self.is_signalled() {
            let notified = self.notify.notified();
            if self.is_signalled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalled_wait_returns_immediately() {
        let token = StopToken::new();
        token.signal();
        token.wait().await;
        assert!(token.is_signalled());
    }

    #[tokio::test]
    async fn signal_wakes_waiter_on_any_clone() {
        let token = StopToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        token.signal();
        handle.await.unwrap();
    }
}
