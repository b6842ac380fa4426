//! Per-request cancellation and deadlines.

use crate::error::RoomserverError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Carries cancellation and an optional deadline through a request.
///
/// Only remote round trips and retry sleeps are raced against the context.
/// Work already handed to a room actor always runs to completion, so a
/// cancelled request never leaves half-applied local state.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// A child context: cancelled with its parent, bounded by the earlier
    /// of the two deadlines.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the request is already over.
    pub fn check(&self) -> Result<(), RoomserverError> {
        if self.is_cancelled() {
            Err(RoomserverError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it finishes, the context is cancelled, or the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, RoomserverError>
    where
        F: Future<Output = Result<T, RoomserverError>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RoomserverError::Cancelled),
            _ = deadline => Err(RoomserverError::Cancelled),
            result = fut => result,
        }
    }

    /// Sleep for `duration` unless the request ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), RoomserverError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}
