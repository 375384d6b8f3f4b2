//! Cancellable query context.
//!
//! Every database round trip made by a collector goes through [`QueryContext::run`], so an expired
//! deadline or a cancelled scrape aborts the pending query instead of holding a server-side cursor.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Deadline plus a cancellation token inherited from the caller.
///
/// Contexts are cheap to clone. Children created with [`with_timeout`][Self::with_timeout] or
/// [`with_cancel`][Self::with_cancel] observe everything their parent observes.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    token: CancellationToken,
}

/// Cancels the context returned alongside it by [`QueryContext::with_cancel`].
///
/// Dropping the handle without calling [`cancel`][Self::cancel] leaves the context running.
#[derive(Debug)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl QueryContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// The child keeps the earlier of the parent's deadline and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self { deadline: Some(deadline), token: self.token.clone() }
    }

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let token = self.token.child_token();
        (Self { deadline: self.deadline, token: token.clone() }, CancelHandle(token))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Drives `fut` unless the context finishes first, in which case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending().await,
            }
        };
        tokio::select! {
            output = fut => Ok(output),
            () = self.token.cancelled() => Err(ContextError::Canceled),
            () = deadline => Err(ContextError::DeadlineExceeded),
        }
    }
}
