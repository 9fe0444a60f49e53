//! The three step protocol shared by tasks and custom suspension points.
use crate::{
    error::{Error, Result},
    frame::resume_context,
    handle::Handle,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// What a frame should do after [Awaitable::suspend] has been called.
#[derive(Debug)]
pub enum Suspension {
    /// Stay suspended until someone resumes the continuation.
    Park,
    /// The result became available while registering: do not suspend at all.
    Ready,
    /// Suspend and resume the given frame in place of the current one.
    Transfer(Handle),
}

/// Something a task body can suspend on.
///
/// The runtime calls [ready][Awaitable::ready] first. If that returns false it calls
/// [suspend][Awaitable::suspend] exactly once with the continuation of the awaiting frame, and
/// once the frame has been resumed it calls [resume][Awaitable::resume] to obtain the result.
///
/// Implementations that hand the continuation to another thread (a timer, an I/O reactor) are
/// responsible for making sure it is resumed at most once and only after the event it is
/// waiting on. A continuation may be resumed before `suspend` returns: the frame notices and
/// polls again rather than parking.
pub trait Awaitable {
    /// The value produced once the suspension ends.
    type Output;

    /// Whether the result is already available, in which case no suspension happens.
    fn ready(&self) -> bool;

    /// Register `continuation` to be resumed when the result becomes available.
    ///
    /// # Errors
    /// Returning an error marks the awaiting frame as failed and reports the error from the
    /// resume that was in progress.
    fn suspend(&mut self, continuation: Handle) -> Result<Suspension>;

    /// Produce the result after the suspension ended (or immediately if it was ready).
    fn resume(&mut self) -> Self::Output;

    /// Wrap this awaitable so it can be `.await`ed inside a task body.
    fn into_await(self) -> Await<Self>
    where
        Self: Sized,
    {
        Await {
            awaitable: self,
            state: AwaitState::Fresh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaitState {
    Fresh,
    Suspended,
    Done,
}

/// A future running the [Awaitable] protocol against the task frame polling it.
///
/// # Panics
/// Polling an `Await` from anything other than a task frame (for example an async runtime)
/// panics: there is no continuation to hand to the awaitable.
#[derive(Debug)]
#[must_use = "awaitables do nothing unless awaited"]
pub struct Await<A> {
    awaitable: A,
    state: AwaitState,
}

impl<A: Awaitable + Unpin> Future for Await<A> {
    type Output = A::Output;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<A::Output> {
        let this = self.get_mut();
        match this.state {
            AwaitState::Fresh => (),
            AwaitState::Suspended => {
                this.state = AwaitState::Done;
                return Poll::Ready(this.awaitable.resume());
            }
            AwaitState::Done => panic!("`Await` polled after completion"),
        }

        if !this.awaitable.ready() {
            let Some(res) = resume_context(ctx) else {
                panic!(
                    "{}",
                    Error::invalid_state("awaitable polled outside of a coroutine frame")
                );
            };

            let awaitable = &mut this.awaitable;
            if res.suspend_with(|continuation| awaitable.suspend(continuation)) {
                this.state = AwaitState::Suspended;
                return Poll::Pending;
            }
        }

        this.state = AwaitState::Done;
        Poll::Ready(this.awaitable.resume())
    }
}
