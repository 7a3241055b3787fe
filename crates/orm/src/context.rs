//! Cancellable execution context
//!
//! Every public operation that may touch the engine takes a [`Context`]. A
//! context is cancelled explicitly through its token or implicitly when its
//! deadline passes; the in-flight operation then returns
//! [`OrmError::Cancelled`] or [`OrmError::DeadlineExceeded`] instead of
//! waiting for the engine.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{OrmError, OrmResult};

/// Cancellation and deadline scope for ORM operations
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a context cancelled together with this one.
    ///
    /// The child keeps the earlier of the two deadlines.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast when the context is already done
    pub fn check(&self) -> OrmResult<()> {
        if self.token.is_cancelled() {
            return Err(OrmError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(OrmError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Drive `fut` until it completes or the context ends, whichever is first.
    ///
    /// When the context wins, `fut` is dropped.
    pub async fn run<F, T>(&self, fut: F) -> OrmResult<T>
    where
        F: Future<Output = OrmResult<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(OrmError::Cancelled),
            _ = deadline => Err(OrmError::DeadlineExceeded),
            result = fut => result,
        }
    }
}
