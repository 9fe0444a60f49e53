use crate::{
    error::{Error, Result},
    frame::{FrameId, FrameState, RawFrame},
};
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, Weak},
};
use tracing::trace;

/// A non-owning reference to a [Frame][crate::Frame] that can resume, query or destroy it.
///
/// Handles are what awaitables receive as their continuation: resuming one re-enters the
/// cooperative model on whichever thread made the call. Holding a handle never keeps the frame
/// alive; once the owner has released it every operation reports the frame as destroyed.
#[derive(Clone)]
pub struct Handle {
    frame: Weak<dyn RawFrame>,
    id: FrameId,
}

impl Handle {
    pub(crate) fn new(frame: Weak<dyn RawFrame>, id: FrameId) -> Self {
        Self { frame, id }
    }

    /// The identifier of the referenced frame.
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Resume the referenced frame.
    ///
    /// When the frame completes and hands back a continuation (or suspends on a task that has
    /// not started yet) that frame is resumed next, in a loop rather than by nesting calls, so
    /// chains of any depth run in constant stack space.
    ///
    /// # Errors
    /// [ErrorKind::InvalidResume][crate::ErrorKind::InvalidResume] if the frame (or a frame
    /// later in the chain) can no longer run, [ErrorKind::InvalidState][crate::ErrorKind::InvalidState] if a
    /// frame is already running or broke the suspension protocol.
    pub fn resume(&self) -> Result<()> {
        let frame = self
            .frame
            .upgrade()
            .ok_or_else(|| Error::invalid_resume(self.id))?;

        trampoline(frame)
    }

    /// Whether the referenced frame can never be resumed again.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// The current state of the referenced frame.
    pub fn state(&self) -> FrameState {
        self.frame
            .upgrade()
            .map_or(FrameState::Destroyed, |frame| frame.core().state())
    }

    /// Destroy the referenced frame, dropping its body and any locals it still holds.
    ///
    /// This is normally done by the owner when it is dropped.
    ///
    /// # Errors
    /// [ErrorKind::Destroyed][crate::ErrorKind::Destroyed] if the frame is already gone,
    /// [ErrorKind::InvalidState][crate::ErrorKind::InvalidState] if it is currently running.
    pub fn destroy(&self) -> Result<()> {
        match self.frame.upgrade() {
            Some(frame) => frame.destroy(),
            None => Err(Error::destroyed(Some(self.id))),
        }
    }
}

/// Run `first` and then every frame its resume hands back until the chain settles.
pub(crate) fn trampoline(first: Arc<dyn RawFrame>) -> Result<()> {
    let id = first.core().id();
    let mut steps = 1usize;
    let mut next = first.run()?;
    drop(first);

    while let Some(handle) = next.take() {
        let frame = handle
            .frame
            .upgrade()
            .ok_or_else(|| Error::invalid_resume(handle.id))?;
        next = frame.run()?;
        steps += 1;
    }
    trace!(frame = %id, steps, "resume chain settled");

    Ok(())
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
