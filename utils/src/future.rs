//! Deliver the outcome of an asynchronous operation.
//!
//! Two styles are supported:
//! - [Handler]: a callback invoked exactly once by whoever finishes the operation
//!   (any `FnOnce(Result<T, E>)` closure is a [Handler]).
//! - [Completion]: a container that can be awaited or blocked on until the
//!   operation finishes.
//!
//! A [Promise] is the [Handler] paired with a [Completion], so an API that only
//! accepts callbacks can still be consumed as a future.
//!
//! # Example
//!
//! ```
//! use sluice_utils::future::{promise, Handler};
//!
//! let (promise, completion) = promise::<usize, ()>();
//! Box::new(promise).completed(42);
//! assert_eq!(completion.wait(), Ok(42));
//! ```

use futures::{channel::oneshot, executor::block_on, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use thiserror::Error;

/// Reason a [Completion] did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The [Promise] was dropped before it was fulfilled.
    #[error("canceled")]
    Canceled,
    /// The operation failed.
    #[error("failed: {0}")]
    Failed(E),
}

/// Callback notified with the outcome of an operation.
///
/// Exactly one of [Handler::completed] or [Handler::failed] is invoked, which
/// consumes the handler. [Handler::updated] may be invoked any number of times
/// before that to report progress.
pub trait Handler<T, E>: Send + 'static {
    /// The operation finished successfully.
    fn completed(self: Box<Self>, result: T);

    /// The operation failed.
    fn failed(self: Box<Self>, error: E);

    /// The operation made progress but has not finished.
    fn updated(&mut self, _progress: &T) {}
}

impl<T, E, F> Handler<T, E> for F
where
    F: FnOnce(Result<T, E>) + Send + 'static,
{
    fn completed(self: Box<Self>, result: T) {
        (*self)(Ok(result))
    }

    fn failed(self: Box<Self>, error: E) {
        (*self)(Err(error))
    }
}

/// Producer half of a [Completion].
///
/// Dropping a [Promise] without fulfilling it resolves the [Completion] with
/// [Error::Canceled].
pub struct Promise<T, E> {
    sender: oneshot::Sender<Result<T, E>>,
}

impl<T, E> std::fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("canceled", &self.sender.is_canceled())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    /// Fulfill the promise with a value.
    pub fn complete(self, value: T) {
        // The completion may have been dropped, in which case nobody is listening.
        let _ = self.sender.send(Ok(value));
    }

    /// Fulfill the promise with an error.
    pub fn fail(self, error: E) {
        let _ = self.sender.send(Err(error));
    }

    /// Returns whether the paired [Completion] has been dropped.
    pub fn is_canceled(&self) -> bool {
        self.sender.is_canceled()
    }
}

impl<T, E> Handler<T, E> for Promise<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn completed(self: Box<Self>, result: T) {
        self.complete(result);
    }

    fn failed(self: Box<Self>, error: E) {
        self.fail(error);
    }
}

/// Consumer half of a [Promise].
///
/// Resolves once the paired [Promise] is fulfilled or dropped. A [Completion]
/// can be awaited from async code or waited on from a blocking thread.
pub struct Completion<T, E> {
    receiver: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> std::fmt::Debug for Completion<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// Create a linked [Promise] and [Completion].
pub fn promise<T, E>() -> (Promise<T, E>, Completion<T, E>) {
    let (sender, receiver) = oneshot::channel();
    (Promise { sender }, Completion { receiver })
}

impl<T, E> Completion<T, E> {
    /// Create a [Completion] that is already resolved.
    pub fn ready(result: Result<T, E>) -> Self {
        let (promise, completion) = promise();
        match result {
            Ok(value) => promise.complete(value),
            Err(error) => promise.fail(error),
        }
        completion
    }

    /// Take the outcome if the operation has finished.
    ///
    /// Returns `None` while the operation is still pending. Once an outcome has
    /// been returned, subsequent calls report [Error::Canceled].
    pub fn try_take(&mut self) -> Option<Result<T, Error<E>>> {
        match self.receiver.try_recv() {
            Ok(Some(result)) => Some(result.map_err(Error::Failed)),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(Error::Canceled)),
        }
    }

    /// Block the current thread until the operation finishes.
    pub fn wait(self) -> Result<T, Error<E>> {
        block_on(self)
    }
}

impl<T, E> Future for Completion<T, E> {
    type Output = Result<T, Error<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_unpin(cx).map(|result| match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::Failed(error)),
            Err(oneshot::Canceled) => Err(Error::Canceled),
        })
    }
}
