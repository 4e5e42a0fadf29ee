//! Per-call cancellation and deadline.

use crate::error::StoreError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation signal and optional deadline supplied by the caller of a
/// store operation.
///
/// A cancelled context fails with `StoreError::Cancelled`; an expired deadline
/// fails with `StoreError::Persistence`.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context tied to an existing cancellation token (e.g. a request's or
    /// the process shutdown token).
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Tightens the deadline to `now + timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tightens the deadline; an earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails immediately if the context is already cancelled or expired.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Err(deadline_exceeded()),
            _ => Ok(()),
        }
    }

    /// Resolves with the matching error once the context is cancelled or its
    /// deadline passes. Pending forever for a background context.
    pub async fn done(&self) -> StoreError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => StoreError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => deadline_exceeded(),
            },
            None => {
                self.cancel.cancelled().await;
                StoreError::Cancelled
            }
        }
    }
}

fn deadline_exceeded() -> StoreError {
    StoreError::Persistence("deadline exceeded".to_string())
}
