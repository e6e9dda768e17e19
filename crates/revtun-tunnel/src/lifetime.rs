//! Cancellation with a reason
//!
//! A [`LifetimeToken`] is a child of a session-wide [`CancellationToken`].
//! It remembers why it ended so watchers can tell an expired auto-close
//! deadline apart from an ordinary teardown.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Cancelled,
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct LifetimeToken {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl LifetimeToken {
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Child token that ends by itself after `after`
    pub fn with_deadline(parent: &CancellationToken, after: Duration) -> Self {
        let lifetime = Self::child_of(parent);
        let expiring = lifetime.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = expiring.token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    let _ = expiring.reason.set(CloseReason::DeadlineExceeded);
                    expiring.token.cancel();
                }
            }
        });
        lifetime
    }

    pub fn cancel(&self) {
        let _ = self.reason.set(CloseReason::Cancelled);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `None` while alive. A token ended through its parent reports `Cancelled`.
    pub fn reason(&self) -> Option<CloseReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(self.reason.get().copied().unwrap_or(CloseReason::Cancelled))
    }

    pub async fn cancelled(&self) -> CloseReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(CloseReason::Cancelled)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
