//! Bounded retry with backoff for async operations that can fail transiently.
//!
//! An [`Operation`] is run to completion. If it fails with an error the [`Condition`] classifies
//! as transient, the [`retry::Retry`] future sleeps for the next delay of a [`strategy`] and runs
//! the operation again. A fatal error, or a strategy that has run out of delays, resolves the
//! future to that error unchanged.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::exponential::Exponential;
//!
//! #[derive(Debug, PartialEq)]
//! enum Failure {
//!     Busy,
//!     Corrupt,
//! }
//!
//! async fn write() -> Result<i64, Failure> {
//!     Ok(7)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let strategy = Exponential::from_millis(100, 5_000, 2.0, 0.2, Some(5));
//!     let id = Retry::new(strategy, write, |e: &Failure| *e == Failure::Busy).await;
//!     assert_eq!(id, Ok(7));
//! }
//! ```

use std::future::Future;

/// Backoff strategies. A strategy is an iterator of delays; when it returns `None` the retry
/// gives up. Cap the number of retries either through the strategy's own attempt limit or with
/// [`take`](https://doc.rust-lang.org/std/iter/struct.Take.html).
pub mod strategy;

/// Conditional retry till we run out of backoff.
pub mod retry;

/// Classifies an error as transient (`true`, retry it) or fatal (`false`, give up now).
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// Anything that produces a fresh [`Future`] every time it is run. Each retry calls
/// [`Operation::run`] again, so the operation must be restartable.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

// Operation exists so that Retry is generic over one type instead of the closure, its future,
// and the future's item and error types all at once.
