//! Outcome model: the three-way result of an async execution.
//!
//! Cancellation is a first-class variant instead of a special error value,
//! so callers pattern-match on it rather than inspecting errors.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Result of running a wrapped async function once (or through a Retryer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    Success(T),
    Failure(E),
    /// The execution was aborted before it settled.
    Cancelled,
}

impl<T, E> Outcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// Collapse into the shape the public entry points return:
    /// cancellation becomes `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, E> {
        match self {
            Outcome::Success(v) => Ok(Some(v)),
            Outcome::Failure(e) => Err(e),
            Outcome::Cancelled => Ok(None),
        }
    }

    pub fn map_err<F, O: FnOnce(E) -> F>(self, op: O) -> Outcome<T, F> {
        match self {
            Outcome::Success(v) => Outcome::Success(v),
            Outcome::Failure(e) => Outcome::Failure(op(e)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => Outcome::Success(v),
            Err(e) => Outcome::Failure(e),
        }
    }
}

pub(crate) type Settle<T, E> = oneshot::Sender<Result<Option<T>, E>>;

/// Future returned by the eager entry points of the async primitives
/// (`maybe_execute`, `flush`).
///
/// The call has already been registered with the primitive by the time this
/// value exists, so dropping it without awaiting is fine: the execution
/// still happens, only the result is discarded. If the primitive drops the
/// call (cancel, abort, instance dropped) the future resolves to `Ok(None)`.
pub struct Pending<T, E> {
    inner: PendingInner<T, E>,
}

enum PendingInner<T, E> {
    Ready(Option<Result<Option<T>, E>>),
    Waiting(oneshot::Receiver<Result<Option<T>, E>>),
}

impl<T, E> Pending<T, E> {
    pub(crate) fn channel() -> (Settle<T, E>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                inner: PendingInner::Waiting(rx),
            },
        )
    }

    pub(crate) fn ready(result: Result<Option<T>, E>) -> Self {
        Self {
            inner: PendingInner::Ready(Some(result)),
        }
    }

    /// A call that was not executed (disabled, rejected).
    pub(crate) fn skipped() -> Self {
        Self::ready(Ok(None))
    }
}

// No field is ever pin-projected.
impl<T, E> Unpin for Pending<T, E> {}

impl<T, E> Future for Pending<T, E> {
    type Output = Result<Option<T>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            PendingInner::Ready(result) => Poll::Ready(result.take().unwrap_or(Ok(None))),
            PendingInner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_closed)) => Poll::Ready(Ok(None)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T, E> std::fmt::Debug for Pending<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.inner {
            PendingInner::Ready(_) => "ready",
            PendingInner::Waiting(_) => "waiting",
        };
        f.debug_struct("Pending").field("state", &state).finish()
    }
}
