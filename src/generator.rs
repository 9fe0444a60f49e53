//! Lazy, pull based, single pass sequences.
use crate::{
    error::Error,
    frame::{Frame, FrameBox, FrameState, resume_context},
    handle::Handle,
    promise::{FrameKind, Promise},
};
use std::{
    convert::Infallible,
    fmt,
    future::Future,
    iter::FusedIterator,
    marker::PhantomData,
    pin::Pin,
    sync::{Mutex, PoisonError},
    task::{Context, Poll},
};

/// The [Promise] of a generator frame: the last yielded value and the body's error, if any.
#[derive(Debug)]
pub struct GeneratorPromise<T, E> {
    current: Mutex<Option<T>>,
    error: Mutex<Option<E>>,
}

impl<T, E> Default for GeneratorPromise<T, E> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
            error: Mutex::new(None),
        }
    }
}

impl<T, E> GeneratorPromise<T, E> {
    fn take_current(&self) -> Option<T> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_error(&self) -> Option<E> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl<T, E> Promise for GeneratorPromise<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Yield = T;
    type Value = ();
    type Error = E;

    const KIND: FrameKind = FrameKind::Generator;

    fn on_yield(&self, value: T) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    fn on_return(&self, _: ()) {}

    fn on_unhandled_error(&self, error: E) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn final_suspend(&self) -> Option<Handle> {
        None
    }
}

/// A lazily evaluated sequence of `T` produced by a coroutine body.
///
/// Nothing in the body runs until the first value is pulled, each pull runs the body up to its
/// next [yield][Co::yield_value] and dropping the generator at any point destroys the body along
/// with whatever locals it is holding.
///
/// ```
/// use coroutine_rt::{Co, Generator};
/// use std::convert::Infallible;
///
/// let squares = Generator::<u32, Infallible>::new(async |co: Co<u32>| {
///     for n in 1.. {
///         co.yield_value(n * n).await;
///     }
///     Ok(())
/// });
///
/// let first: Vec<u32> = squares.into_values().take(4).collect();
/// assert_eq!(first, [1, 4, 9, 16]);
/// ```
pub struct Generator<T, E = Infallible>
where
    T: Send + 'static,
    E: Send + 'static,
{
    frame: FrameBox<GeneratorPromise<T, E>>,
    current: Option<T>,
    finished: bool,
}

impl<T, E> fmt::Debug for Generator<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("frame", &self.frame)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T, E> Generator<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a generator from a body that yields through the provided [Co].
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Co<T>) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let body = f(Co { _yield: PhantomData });

        Self {
            frame: Frame::create(GeneratorPromise::default(), body),
            current: None,
            finished: false,
        }
    }

    /// Resume the body once and return the value it yielded.
    ///
    /// Returns `Ok(None)` once the body has returned, and after that never resumes it again. If
    /// the body returned an error it is handed back here, in place of the next value, and the
    /// sequence ends.
    ///
    /// # Panics
    /// Panics if the body awaited something other than [Co::yield_value] or the frame was
    /// destroyed through a [Handle].
    pub fn advance(&mut self) -> Result<Option<&T>, E> {
        self.step()?;

        Ok(self.current.as_ref())
    }

    /// The most recently yielded value, without resuming the body.
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Whether the sequence has ended.
    pub fn is_done(&self) -> bool {
        self.finished || self.frame.state().is_done()
    }

    /// A non-owning handle to the generator's frame.
    pub fn handle(&self) -> Handle {
        self.frame.handle()
    }

    fn step(&mut self) -> Result<(), E> {
        self.current = None;
        if self.finished {
            return Ok(());
        }

        if let Err(err) = self.frame.resume() {
            self.finished = true;
            panic!("generator {}: {err}", self.frame.id());
        }

        let promise = self.frame.promise();
        match self.frame.state() {
            FrameState::Suspended => {
                self.current = promise.take_current();
                Ok(())
            }

            FrameState::Failed => {
                self.finished = true;
                promise.take_error().map_or(Ok(()), Err)
            }

            _ => {
                self.finished = true;
                Ok(())
            }
        }
    }
}

impl<T> Generator<T, Infallible>
where
    T: Send + 'static,
{
    /// Iterate over the values of a generator that can not fail.
    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.map(|res| match res {
            Ok(value) => value,
            Err(never) => match never {},
        })
    }
}

impl<T, E> Iterator for Generator<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Item = Result<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(()) => self.current.take().map(Ok),
            Err(err) => Some(Err(err)),
        }
    }
}

impl<T, E> FusedIterator for Generator<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
}

impl<F, Fut, T, E> From<F> for Generator<T, E>
where
    F: FnOnce(Co<T>) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

/// A yield handle passed to the body of a [Generator].
///
/// It carries no state of its own: yielded values are routed to whichever generator frame is
/// polling the body.
pub struct Co<T> {
    _yield: PhantomData<fn(T)>,
}

impl<T> fmt::Debug for Co<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Co").finish()
    }
}

impl<T> Clone for Co<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Co<T> {}

impl<T> Co<T>
where
    T: Send + 'static,
{
    /// Hand `value` to the consumer of the generator and suspend until the next pull.
    pub async fn yield_value(&self, value: T) {
        Yield { value: Some(value) }.await
    }

    /// Yield every value produced by `inner` in turn, returning its error if it fails.
    pub async fn yield_from<E>(&self, mut inner: Generator<T, E>) -> Result<(), E>
    where
        E: Send + 'static,
    {
        while let Some(res) = inner.next() {
            self.yield_value(res?).await;
        }

        Ok(())
    }
}

struct Yield<T> {
    value: Option<T>,
}

impl<T> Unpin for Yield<T> {}

impl<T> Future for Yield<T>
where
    T: Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
        let Some(value) = self.get_mut().value.take() else {
            // second poll: the consumer has pulled again
            return Poll::Ready(());
        };

        match resume_context(ctx) {
            Some(res) => {
                res.yield_value(value);
                Poll::Pending
            }
            None => panic!(
                "{}",
                Error::invalid_state("yield_value polled outside of a generator frame")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;

    fn count_to(n: u32) -> Generator<u32> {
        Generator::new(move |co: Co<u32>| async move {
            for i in 1..=n {
                co.yield_value(i).await;
            }
            Ok(())
        })
    }

    #[test_case(0, &[]; "empty")]
    #[test_case(1, &[1]; "single")]
    #[test_case(5, &[1, 2, 3, 4, 5]; "several")]
    #[test]
    fn finite_sequences(n: u32, expected: &[u32]) {
        let values: Vec<u32> = count_to(n).into_values().collect();

        assert_eq!(values, expected);
    }

    #[test]
    fn advance_exposes_the_current_value_without_resuming() {
        let mut g = count_to(2);
        assert_eq!(g.current(), None);

        assert_eq!(g.advance(), Ok(Some(&1)));
        assert_eq!(g.current(), Some(&1));
        assert_eq!(g.current(), Some(&1));
        assert_eq!(g.advance(), Ok(Some(&2)));
        assert!(!g.is_done());

        assert_eq!(g.advance(), Ok(None));
        assert!(g.is_done());
        assert_eq!(g.advance(), Ok(None));
    }

    #[test]
    fn handles_report_the_generator_state() {
        let mut g = count_to(1);
        let handle = g.handle();
        assert_eq!(handle.state(), FrameState::Created);

        g.next();
        assert_eq!(handle.state(), FrameState::Suspended);
        g.next();
        assert!(handle.is_done());

        drop(g);
        assert_eq!(handle.state(), FrameState::Destroyed);
        assert!(handle.resume().unwrap_err().is_invalid_resume());
    }

    #[test]
    #[should_panic(expected = "invalid coroutine state")]
    fn awaiting_foreign_futures_panics() {
        let mut g: Generator<u32> = Generator::new(async |_co: Co<u32>| {
            std::future::ready(()).await;
            std::future::pending::<()>().await;
            Ok(())
        });

        let _ = g.advance();
    }
}
