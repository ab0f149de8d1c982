//! Timeout helpers built on top of [`SleepProvider`].

use crate::SleepProvider;
use futures::Future;
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// An error value returned when a timeout expires before the wrapped
/// future completes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Timeout expired")]
#[non_exhaustive]
pub struct TimeoutError;

impl From<TimeoutError> for std::io::Error {
    fn from(err: TimeoutError) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::TimedOut, err)
    }
}

/// Extension trait on [`SleepProvider`] for timeouts.
pub trait SleepProviderExt: SleepProvider {
    /// Wrap a future with a timeout.
    ///
    /// The output of the new future is a `Result`: `Ok` with the
    /// original output if the future completes in time, and
    /// `Err(TimeoutError)` otherwise.  On timeout the wrapped future
    /// is dropped, cancelling whatever it was doing.
    fn timeout<F: Future>(&self, duration: Duration, future: F) -> Timeout<F, Self::SleepFuture> {
        let sleep_future = self.sleep(duration);
        Timeout {
            future,
            sleep_future,
        }
    }
}

impl<T: SleepProvider> SleepProviderExt for T {}

/// A future implementing [`SleepProviderExt::timeout`].
#[pin_project]
pub struct Timeout<T, S> {
    /// The future we want to execute.
    #[pin]
    future: T,
    /// The future implementing the timeout.
    #[pin]
    sleep_future: S,
}

impl<T, S> Future for Timeout<T, S>
where
    T: Future,
    S: Future<Output = ()>,
{
    type Output = Result<T::Output, TimeoutError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(x) = this.future.poll(cx) {
            return Poll::Ready(Ok(x));
        }
        match this.sleep_future.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => Poll::Ready(Err(TimeoutError)),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn timeouts() {
        crate::test_with_one_runtime!(|rt| async move {
            // A future that's already ready wins the race.
            let r = rt
                .timeout(Duration::from_secs(60), futures::future::ready(7_u32))
                .await;
            assert_eq!(r, Ok(7));

            // A future that never completes loses it.
            let r = rt
                .timeout(Duration::from_millis(10), futures::future::pending::<()>())
                .await;
            assert_eq!(r, Err(TimeoutError));
        });
    }
}
