use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// A retry is either running the [`Operation`] or cooling off before the next run. The state
/// machine flips between the two:
/// ```no_rust
///                  (Ok) -------------------------------> [Return(Ok)]
///                 /
/// (Running) ---- (Err, fatal) -------------------------> [Return(Err)]
///     ^           \
///     |            (Err, transient) -> next delay? --- None -> [Return(Err)]
///     |                                      \
///     +------------ (Ready) <-- (Sleeping) <-- Some(delay)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retry runs an operation until it succeeds, fails fatally, or the backoff strategy runs dry.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    retry_state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    attempts: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            retry_state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            condition,
            operation,
            attempts: 1,
        }
    }

    /// Number of times the operation has been started so far, the first run included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Schedules the sleep before the next attempt. Hands the error back if the strategy has no
    /// delays left.
    fn cool_off(mut self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        match self.as_mut().project().backoff.next() {
            None => Err(err),
            Some(duration) => {
                let till = sleep_until(Instant::now() + duration);
                self.as_mut()
                    .project()
                    .retry_state
                    .set(RetryState::Sleeping(till));
                Ok(())
            }
        }
    }

    fn reattempt(mut self: Pin<&mut Self>) {
        let future = {
            let this = self.as_mut().project();
            *this.attempts += 1;
            this.operation.run()
        };
        self.as_mut()
            .project()
            .retry_state
            .set(RetryState::Running(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.as_mut().project().retry_state.project() {
            RetryStateProj::Running(op) => match op.poll(cx) {
                Poll::Ready(Ok(item)) => Poll::Ready(Ok(item)),
                Poll::Ready(Err(e)) => {
                    if !self.as_mut().condition.can_retry(&e) {
                        return Poll::Ready(Err(e));
                    }
                    match self.as_mut().cool_off(e) {
                        Ok(_) => self.as_mut().poll(cx),
                        Err(e) => Poll::Ready(Err(e)),
                    }
                }
                Poll::Pending => Poll::Pending,
            },
            RetryStateProj::Sleeping(sleep) => match sleep.poll(cx) {
                Poll::Ready(_) => {
                    self.as_mut().reattempt();
                    self.poll(cx)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
