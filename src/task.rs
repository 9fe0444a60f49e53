//! Lazily started, awaitable computations that resume whoever awaits them on completion.
use crate::{
    awaitable::{Await, Awaitable, Suspension},
    error::{Error, Result},
    frame::{Frame, FrameBox, FrameId, FrameState},
    handle::Handle,
    promise::{FrameKind, Promise},
};
use std::{
    convert::Infallible,
    fmt,
    future::{Future, IntoFuture},
    mem,
    sync::{
        Mutex, MutexGuard, PoisonError,
        mpsc::{self, SyncSender},
    },
};
use tracing::trace;

#[derive(Debug)]
enum Outcome<T, E> {
    Empty,
    Value(T),
    Error(E),
    Taken,
}

#[derive(Debug)]
struct Slot<T, E> {
    outcome: Outcome<T, E>,
    continuation: Option<Handle>,
    registered: bool,
}

/// The [Promise] of a task frame: its result cell and the continuation waiting on it.
#[derive(Debug)]
pub struct TaskPromise<T, E> {
    slot: Mutex<Slot<T, E>>,
}

impl<T, E> Default for TaskPromise<T, E> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(Slot {
                outcome: Outcome::Empty,
                continuation: None,
                registered: false,
            }),
        }
    }
}

impl<T, E> TaskPromise<T, E> {
    fn lock(&self) -> MutexGuard<'_, Slot<T, E>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_complete(&self) -> bool {
        !matches!(self.lock().outcome, Outcome::Empty)
    }

    /// Register the continuation to resume on completion.
    ///
    /// Returns false without storing it if the task has already completed.
    fn register(&self, continuation: Handle) -> Result<bool> {
        let mut slot = self.lock();
        if mem::replace(&mut slot.registered, true) {
            return Err(Error::invalid_state("task continuation registered twice"));
        }
        if !matches!(slot.outcome, Outcome::Empty) {
            return Ok(false);
        }
        slot.continuation = Some(continuation);

        Ok(true)
    }

    fn take(&self) -> Result<Result<T, E>> {
        let mut slot = self.lock();
        match mem::replace(&mut slot.outcome, Outcome::Taken) {
            Outcome::Value(value) => Ok(Ok(value)),
            Outcome::Error(err) => Ok(Err(err)),
            Outcome::Empty => {
                slot.outcome = Outcome::Empty;
                Err(Error::invalid_state("task result retrieved before completion"))
            }
            Outcome::Taken => Err(Error::invalid_state("task result retrieved twice")),
        }
    }
}

impl<T, E> Promise for TaskPromise<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Yield = Infallible;
    type Value = T;
    type Error = E;

    const KIND: FrameKind = FrameKind::Task;

    fn on_yield(&self, value: Infallible) {
        match value {}
    }

    fn on_return(&self, value: T) {
        self.lock().outcome = Outcome::Value(value);
    }

    fn on_unhandled_error(&self, error: E) {
        self.lock().outcome = Outcome::Error(error);
    }

    fn final_suspend(&self) -> Option<Handle> {
        self.lock().continuation.take()
    }
}

/// A deferred computation producing `Result<T, E>`.
///
/// A task does nothing until it is awaited from another task or explicitly [started][Task::start].
/// When its body finishes the task resumes the frame awaiting it, if there is one, before
/// parking. Otherwise the result waits to be collected with [try_result][Task::try_result].
///
/// Note that an error stored in a task is only seen by whoever retrieves the result: a chain that
/// never looks at it silently discards it.
///
/// ```
/// use coroutine_rt::{Task, block_on};
/// use std::convert::Infallible;
///
/// fn double(n: u32) -> Task<u32, Infallible> {
///     Task::new(async move { Ok(n * 2) })
/// }
///
/// let quadruple = Task::new(async {
///     let n = double(5).await?;
///     double(n).await
/// });
///
/// assert_eq!(block_on(quadruple), Ok(20));
/// ```
pub struct Task<T, E = Infallible>
where
    T: Send + 'static,
    E: Send + 'static,
{
    frame: FrameBox<TaskPromise<T, E>>,
}

impl<T, E> fmt::Debug for Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.frame).finish()
    }
}

impl<T, E> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a task from its body. The body does not run until the task is driven.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            frame: Frame::create(TaskPromise::default(), body),
        }
    }

    /// Create a task whose body is built by `f` the first time the task runs.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(async move { f().await })
    }

    /// A non-owning handle to the task's frame.
    pub fn handle(&self) -> Handle {
        self.frame.handle()
    }

    /// The identifier of the task's frame.
    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    /// The current state of the task's frame.
    pub fn state(&self) -> FrameState {
        self.frame.state()
    }

    /// Whether the task has finished running.
    pub fn is_done(&self) -> bool {
        self.frame.state().is_done()
    }

    /// Start running the task on the calling thread.
    ///
    /// This returns once the task (and anything it transfers control to) completes or parks on
    /// an awaitable that will resume it later.
    ///
    /// # Errors
    /// [ErrorKind::InvalidState][crate::ErrorKind::InvalidState] if the task was already
    /// started, or if a frame in the chain broke the suspension protocol.
    pub fn start(&self) -> Result<()> {
        if self.frame.state() != FrameState::Created {
            return Err(Error::invalid_state("task has already been started").on_frame(self.id()));
        }
        trace!(frame = %self.id(), "starting task");

        self.frame.resume()
    }

    /// Take the result of a completed task.
    ///
    /// # Errors
    /// [ErrorKind::InvalidState][crate::ErrorKind::InvalidState] if the task has not completed
    /// yet or its result was already taken.
    pub fn try_result(&mut self) -> Result<Result<T, E>> {
        self.frame.promise().take().map_err(|err| err.on_frame(self.id()))
    }
}

impl<T, E> Awaitable for Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = Result<T, E>;

    fn ready(&self) -> bool {
        self.frame.promise().is_complete()
    }

    fn suspend(&mut self, continuation: Handle) -> Result<Suspension> {
        trace!(frame = %self.id(), continuation = %continuation.id(), "registering continuation");
        if !self.frame.promise().register(continuation)? {
            return Ok(Suspension::Ready);
        }

        // a task nobody has started yet runs in place of its awaiter
        match self.frame.state() {
            FrameState::Created => Ok(Suspension::Transfer(self.handle())),
            _ => Ok(Suspension::Park),
        }
    }

    /// # Panics
    /// Panics if the task has not completed or its result was already taken.
    fn resume(&mut self) -> Result<T, E> {
        match self.try_result() {
            Ok(res) => res,
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T, E> IntoFuture for Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Await<Self>;

    fn into_future(self) -> Self::IntoFuture {
        self.into_await()
    }
}

// Promise of the frame driving `block_on`: the result is only sent once the frame has finished
// so the caller can release the frame as soon as it arrives.
struct Completion<T> {
    value: Mutex<Option<T>>,
    tx: Mutex<Option<SyncSender<T>>>,
}

impl<T> Promise for Completion<T>
where
    T: Send + 'static,
{
    type Yield = Infallible;
    type Value = T;
    type Error = Infallible;

    const KIND: FrameKind = FrameKind::Task;

    fn on_yield(&self, value: Infallible) {
        match value {}
    }

    fn on_return(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    fn on_unhandled_error(&self, error: Infallible) {
        match error {}
    }

    fn final_suspend(&self) -> Option<Handle> {
        let value = self.value.lock().unwrap_or_else(PoisonError::into_inner).take();
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let (Some(value), Some(tx)) = (value, tx) {
            // the receiver outlives the driver
            let _ = tx.send(value);
        }

        None
    }
}

/// Run `task` to completion, blocking the calling thread while it is parked on other threads.
///
/// The task is awaited from a driver frame that reports the result back over a channel once it
/// has finished, so this works whether the chain completes on the calling thread or is resumed
/// later by a timer or some other agent. A task that was already started is awaited like any
/// other.
///
/// # Panics
/// Panics if the task already has an awaiter, if its result was already taken or if the chain
/// breaks the suspension protocol. If the continuation is never resumed (for example because
/// the timer it was handed to was dropped) this blocks forever.
pub fn block_on<T, E>(task: Task<T, E>) -> Result<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let completion = Completion {
        value: Mutex::new(None),
        tx: Mutex::new(Some(tx)),
    };
    let driver = Frame::create(completion, async move { Ok(task.await) });

    if let Err(err) = driver.resume() {
        panic!("block_on: {err}");
    }

    match rx.recv() {
        Ok(res) => res,
        Err(_) => panic!("block_on: driver finished without producing a result"),
    }
}
