//! Cancellation and timeout for store operations.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::StoreError;

/// Cancellation/timeout token passed to every store operation.
///
/// Cloning shares the cancellation state; [`OpToken::child`] derives a token
/// that is cancelled together with its parent but can also be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct OpToken {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl OpToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a per-operation deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Derives a token cancelled along with this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            timeout: self.timeout,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Runs an operation under this token.
    ///
    /// Fails with [`StoreError::Cancelled`] if the token is or becomes
    /// cancelled, and with [`StoreError::TimedOut`] if the deadline passes.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled { operation });
        }

        let guarded = async {
            match self.timeout {
                Some(after) => tokio::time::timeout(after, fut)
                    .await
                    .map_err(|_| StoreError::TimedOut { operation, after })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled { operation }),
            result = guarded => result,
        }
    }
}
