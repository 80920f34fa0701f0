use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{NovaError, Result};

/// Cancellation and deadline for one caller-initiated operation.
///
/// Cloning shares the cancellation token; [`CallContext::child`] derives a
/// context that is cancelled with its parent but can also be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            timeout: None,
        }
    }

    /// Tightens the deadline; an earlier existing deadline is kept.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        match self.deadline {
            Some(existing) if existing <= candidate => {}
            _ => {
                self.deadline = Some(candidate);
                self.timeout = Some(timeout);
            }
        }
        self
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            timeout: self.timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Resolves once the context is cancelled or its deadline passes, yielding
    /// the error the interrupted operation should report.
    pub async fn done(&self, operation: &str) -> NovaError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => NovaError::cancelled(operation),
                    _ = tokio::time::sleep_until(deadline) => {
                        NovaError::timeout(operation, self.timeout.unwrap_or_default())
                    }
                }
            }
            None => {
                self.cancel.cancelled().await;
                NovaError::cancelled(operation)
            }
        }
    }

    /// Drives `fut` until it finishes or the context ends, whichever is first.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(NovaError::cancelled(operation));
        }
        tokio::select! {
            biased;
            err = self.done(operation) => Err(err),
            result = fut => result,
        }
    }
}
