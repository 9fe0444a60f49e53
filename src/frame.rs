//! Coroutine frames: the heap allocated state of a single coroutine invocation.
//!
//! A frame body is an ordinary `async` block. The compiler turns it into a state machine holding
//! the captured locals and the current resume point, and we drive that state machine by polling
//! it with a waker that never wakes anything. Instead, the waker's data pointer refers to a
//! `Resumption` record living on the stack of the resuming thread for the duration of the poll. The
//! runtime provided futures ([Co::yield_value][crate::Co::yield_value] and
//! [Await][crate::Await]) use it to report what kind of suspension they are requesting.
use crate::{
    awaitable::Suspension,
    error::{Error, Result},
    handle::{self, Handle},
    promise::{FrameKind, Promise},
};
use std::{
    any::TypeId,
    fmt,
    future::Future,
    pin::Pin,
    ptr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
};
use tracing::{debug, trace, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A process unique identifier for a [Frame], used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u64);

impl FrameId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The observable lifecycle state of a [Frame].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Suspended at its start point: no body code has run yet.
    Created,
    /// Currently being resumed by some caller.
    Running,
    /// Parked at a yield or await point.
    Suspended,
    /// The body returned a value.
    Completed,
    /// The body returned an error, or the frame was poisoned by a panic or contract violation.
    Failed,
    /// The owner released the frame.
    Destroyed,
}

impl FrameState {
    /// Whether the frame can never be resumed again.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Destroyed)
    }
}

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
// Running, and a continuation handed out by the current poll has already been resumed.
const NOTIFIED: u8 = 2;
const SUSPENDED: u8 = 3;
const COMPLETED: u8 = 4;
const FAILED: u8 = 5;
const DESTROYED: u8 = 6;

/// The type erased part of a frame: identity and the atomic state word.
pub(crate) struct FrameCore {
    id: FrameId,
    state: AtomicU8,
    // set while a continuation for the current poll is held by an awaitable
    awaiting: AtomicBool,
}

impl FrameCore {
    fn new() -> Self {
        Self {
            id: FrameId::next(),
            state: AtomicU8::new(CREATED),
            awaiting: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn state(&self) -> FrameState {
        match self.state.load(Ordering::Acquire) {
            CREATED => FrameState::Created,
            RUNNING | NOTIFIED => FrameState::Running,
            SUSPENDED => FrameState::Suspended,
            COMPLETED => FrameState::Completed,
            FAILED => FrameState::Failed,
            _ => FrameState::Destroyed,
        }
    }

    /// Claim the frame for a resume.
    ///
    /// Returns `Ok(false)` if the frame is mid-poll and the resume was recorded as an early wake
    /// for the continuation it handed out: the running resumer will poll again.
    fn acquire(&self) -> Result<bool> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                CREATED | SUSPENDED => {
                    match self.state.compare_exchange(
                        current,
                        RUNNING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.awaiting.store(false, Ordering::Release);
                            return Ok(true);
                        }
                        Err(actual) => current = actual,
                    }
                }

                RUNNING if self.awaiting.swap(false, Ordering::AcqRel) => {
                    match self.state.compare_exchange(
                        RUNNING,
                        NOTIFIED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(false),
                        Err(actual) => current = actual,
                    }
                }

                RUNNING | NOTIFIED => {
                    return Err(Error::invalid_state("frame resumed while it is already running")
                        .on_frame(self.id));
                }

                _ => return Err(Error::invalid_resume(self.id)),
            }
        }
    }

    /// Move from running to suspended. Returns false if an early wake arrived during the poll,
    /// in which case the frame stays running and must be polled again.
    fn park(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, SUSPENDED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                self.state.store(RUNNING, Ordering::Release);
                false
            }
        }
    }

    fn finish(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    fn poison(&self) {
        self.awaiting.store(false, Ordering::Release);
        self.state.store(FAILED, Ordering::Release);
    }

    fn begin_destroy(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match current {
                DESTROYED => return Err(Error::destroyed(Some(self.id))),
                RUNNING | NOTIFIED => {
                    return Err(Error::invalid_state("frame destroyed while it is running")
                        .on_frame(self.id));
                }
                _ => match self.state.compare_exchange(
                    current,
                    DESTROYED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(()),
                    Err(actual) => current = actual,
                },
            }
        }
    }
}

/// Operations a [Handle] needs without knowing the frame's promise type.
pub(crate) trait RawFrame: Send + Sync {
    fn core(&self) -> &FrameCore;

    /// Run one resume of this frame, returning the frame that should be resumed next.
    fn run(&self) -> Result<Option<Handle>>;

    fn destroy(&self) -> Result<()>;
}

type Body<O> = Pin<Box<dyn Future<Output = O> + Send>>;

/// The suspended state of one coroutine invocation: its body, lifecycle state and embedded
/// [Promise].
pub struct Frame<P: Promise> {
    core: FrameCore,
    promise: P,
    body: Mutex<Option<Body<Result<P::Value, P::Error>>>>,
    this: Weak<Frame<P>>,
}

impl<P: Promise> fmt::Debug for Frame<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.core.id)
            .field("kind", &P::KIND)
            .field("state", &self.core.state())
            .finish()
    }
}

impl<P: Promise> Frame<P> {
    /// Allocate a frame for `body` and hand back its owner.
    ///
    /// The body is never polled here: every frame starts suspended at its start point and only
    /// runs once something resumes it.
    pub fn create<F>(promise: P, body: F) -> FrameBox<P>
    where
        F: Future<Output = Result<P::Value, P::Error>> + Send + 'static,
    {
        let frame = Arc::new_cyclic(|this| Frame {
            core: FrameCore::new(),
            promise,
            body: Mutex::new(Some(Box::pin(body))),
            this: this.clone(),
        });
        trace!(frame = %frame.core.id, kind = ?P::KIND, "frame created");

        FrameBox { frame }
    }

    fn handle(&self) -> Handle {
        let this: Weak<dyn RawFrame> = self.this.clone();
        Handle::new(this, self.core.id)
    }

    fn lock_body(&self) -> MutexGuard<'_, Option<Body<Result<P::Value, P::Error>>>> {
        // a poisoned lock means the body panicked, which already marked the frame as failed
        self.body.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, err: Error) -> Error {
        self.core.poison();
        debug!(frame = %self.core.id, %err, "frame poisoned by contract violation");
        err.on_frame(self.core.id)
    }
}

impl<P: Promise> RawFrame for Frame<P> {
    fn core(&self) -> &FrameCore {
        &self.core
    }

    fn run(&self) -> Result<Option<Handle>> {
        if !self.core.acquire()? {
            trace!(frame = %self.core.id, "early wake recorded for running frame");
            return Ok(None);
        }

        let id = self.core.id;
        let handle = self.handle();
        let guard = PoisonOnUnwind(&self.core);

        loop {
            trace!(frame = %id, "resuming frame");
            let mut resumption = Resumption::<P::Yield>::new(&self.core, &handle, P::KIND);
            let poll = {
                let mut body = self.lock_body();
                let Some(fut) = body.as_mut() else {
                    guard.defuse();
                    return Err(self.fail(Error::invalid_resume(id)));
                };
                let waker = resumption.waker();
                let mut ctx = Context::from_waker(&waker);
                fut.as_mut().poll(&mut ctx)
            };

            match poll {
                Poll::Ready(res) => {
                    let state = match res {
                        Ok(value) => {
                            self.promise.on_return(value);
                            COMPLETED
                        }
                        Err(err) => {
                            self.promise.on_unhandled_error(err);
                            FAILED
                        }
                    };
                    self.core.finish(state);
                    guard.defuse();
                    trace!(frame = %id, failed = state == FAILED, "frame finished");

                    return Ok(self.promise.final_suspend());
                }

                Poll::Pending => {
                    let Resumption { cx, yielded } = resumption;
                    if let Some(err) = cx.violation {
                        guard.defuse();
                        return Err(self.fail(err));
                    }
                    if let Some(value) = yielded {
                        self.promise.on_yield(value);
                    } else if !cx.suspended {
                        guard.defuse();
                        return Err(self.fail(Error::invalid_state(
                            "frame body awaited a future that is not a coroutine awaitable",
                        )));
                    }

                    if self.core.park() {
                        guard.defuse();
                        trace!(frame = %id, transfer = ?cx.transfer.as_ref().map(Handle::id), "frame suspended");
                        return Ok(cx.transfer);
                    }
                }
            }
        }
    }

    fn destroy(&self) -> Result<()> {
        self.core.begin_destroy()?;
        // dropping the body runs the destructors of any locals still held at the resume point
        let body = self.lock_body().take();
        drop(body);
        trace!(frame = %self.core.id, "frame destroyed");

        Ok(())
    }
}

/// Marks the frame as failed if the body panics while being polled.
struct PoisonOnUnwind<'a>(&'a FrameCore);

impl PoisonOnUnwind<'_> {
    fn defuse(self) {
        std::mem::forget(self);
    }
}

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        self.0.poison();
        warn!(frame = %self.0.id, "frame body panicked");
    }
}

/// The sole owner of a [Frame]. Dropping it destroys the frame.
pub struct FrameBox<P: Promise> {
    frame: Arc<Frame<P>>,
}

impl<P: Promise> fmt::Debug for FrameBox<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrameBox").field(&self.frame).finish()
    }
}

impl<P: Promise> FrameBox<P> {
    /// A non-owning handle to the owned frame.
    pub fn handle(&self) -> Handle {
        self.frame.handle()
    }

    /// The promise embedded in the owned frame.
    pub fn promise(&self) -> &P {
        &self.frame.promise
    }

    /// The identifier of the owned frame.
    pub fn id(&self) -> FrameId {
        self.frame.core.id
    }

    /// The current lifecycle state of the owned frame.
    pub fn state(&self) -> FrameState {
        self.frame.core.state()
    }

    /// Resume the owned frame along with any continuations its completion hands back.
    pub fn resume(&self) -> Result<()> {
        let frame: Arc<dyn RawFrame> = self.frame.clone();
        handle::trampoline(frame)
    }
}

impl<P: Promise> Drop for FrameBox<P> {
    fn drop(&mut self) {
        if let Err(err) = self.frame.destroy() {
            if err.is_invalid_state() {
                // the running resume holds its own reference and releases the frame when done
                warn!(frame = %self.frame.core.id, "owner dropped a running frame");
            }
        }
    }
}

/// Per-poll record shared with the runtime's futures through the waker.
pub(crate) struct ResumeCx<'a> {
    core: &'a FrameCore,
    handle: &'a Handle,
    kind: FrameKind,
    yield_type: TypeId,
    suspended: bool,
    transfer: Option<Handle>,
    violation: Option<Error>,
}

#[repr(C)]
struct Resumption<'a, Y> {
    // must stay the first field: ResumeCx::yield_value casts back to the full record
    cx: ResumeCx<'a>,
    yielded: Option<Y>,
}

impl<'a, Y: 'static> Resumption<'a, Y> {
    fn new(core: &'a FrameCore, handle: &'a Handle, kind: FrameKind) -> Self {
        Self {
            cx: ResumeCx {
                core,
                handle,
                kind,
                yield_type: TypeId::of::<Y>(),
                suspended: false,
                transfer: None,
                violation: None,
            },
            yielded: None,
        }
    }

    fn waker(&mut self) -> Waker {
        let data = ptr::from_mut(self).cast::<()>().cast_const();
        // SAFETY: the vtable never dereferences the data pointer. It is only read back by
        // resume_context while this record is alive on the stack of Frame::run.
        unsafe { Waker::from_raw(RawWaker::new(data, &RESUME_VTABLE)) }
    }
}

static RESUME_VTABLE: RawWakerVTable = RawWakerVTable::new(clone_detached, noop, noop, noop);

// Clones may outlive the poll they were taken in so they never lead back to the record.
static DETACHED_VTABLE: RawWakerVTable = RawWakerVTable::new(clone_detached, noop, noop, noop);

unsafe fn clone_detached(_: *const ()) -> RawWaker {
    RawWaker::new(ptr::null(), &DETACHED_VTABLE)
}

unsafe fn noop(_: *const ()) {}

/// Recover the [ResumeCx] of the frame currently polling `ctx`, if it is being polled by one.
pub(crate) fn resume_context<'c>(ctx: &'c mut Context<'_>) -> Option<&'c mut ResumeCx<'c>> {
    let waker = ctx.waker();
    if !ptr::eq(waker.vtable(), &RESUME_VTABLE) {
        return None;
    }

    // SAFETY: the only waker using RESUME_VTABLE is the one built by Resumption::waker and
    // borrowed by the Context handed to the body in Frame::run. Cloning it yields a detached
    // waker, so a matching vtable means we are inside that poll and the record is alive and not
    // otherwise accessed until the poll returns. ResumeCx is the first field of the repr(C)
    // Resumption.
    unsafe { waker.data().cast::<ResumeCx<'c>>().cast_mut().as_mut() }
}

impl ResumeCx<'_> {
    fn violate(&mut self, err: Error) {
        self.violation.get_or_insert(err);
    }

    /// Record `value` as the yielded value of the current generator frame.
    pub(crate) fn yield_value<T: Send + 'static>(&mut self, value: T) {
        if self.kind != FrameKind::Generator || self.yield_type != TypeId::of::<T>() {
            self.violate(Error::invalid_state(
                "yield_value awaited outside of a generator frame of the matching type",
            ));
            return;
        }
        if self.suspended {
            self.violate(Error::invalid_state("frame suspended twice in a single resume"));
            return;
        }
        self.suspended = true;

        // SAFETY: the yield type of this record was checked above, so the ResumeCx we point at
        // is the first field of a Resumption<'_, T>.
        let resumption = unsafe { &mut *ptr::from_mut(self).cast::<Resumption<'_, T>>() };
        resumption.yielded = Some(value);
    }

    /// Suspend the current task frame on an awaitable.
    ///
    /// `suspend` is handed the continuation for this frame. Returns false if the awaitable
    /// declined to suspend and its result is available right away.
    pub(crate) fn suspend_with<F>(&mut self, suspend: F) -> bool
    where
        F: FnOnce(Handle) -> Result<Suspension>,
    {
        if self.kind != FrameKind::Task {
            self.violate(Error::invalid_state(
                "awaitables can only be awaited inside a task frame",
            ));
            return true;
        }
        if self.suspended {
            self.violate(Error::invalid_state("frame suspended twice in a single resume"));
            return true;
        }

        // the continuation may be resumed from another agent before this poll returns
        self.core.awaiting.store(true, Ordering::Release);
        match suspend(self.handle.clone()) {
            Ok(Suspension::Park) => {
                self.suspended = true;
                true
            }

            Ok(Suspension::Ready) => {
                self.core.awaiting.store(false, Ordering::Release);
                false
            }

            Ok(Suspension::Transfer(next)) => {
                self.core.awaiting.store(false, Ordering::Release);
                self.suspended = true;
                self.transfer = Some(next);
                true
            }

            Err(err) => {
                self.core.awaiting.store(false, Ordering::Release);
                self.violate(err);
                true
            }
        }
    }
}
