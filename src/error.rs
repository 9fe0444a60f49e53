//! Runtime errors raised when a building block is used outside of its invariants.
//!
//! Errors produced *inside* a coroutine body are user typed and never pass through here: they
//! are captured by the frame's [Promise][crate::Promise] and handed back to whoever retrieves
//! the result.
use crate::frame::FrameId;
use thiserror::Error;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A contract violation detected by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// The frame the violation was detected on, when known.
    pub frame: Option<FrameId>,
}

/// The category of a runtime [Error].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// A frame that has completed, failed or been destroyed was resumed.
    #[error("attempt to resume a frame that can no longer run")]
    InvalidResume,

    /// A protocol rule was broken: concurrent resume, a continuation registered twice, a
    /// result retrieved twice or a foreign future awaited inside a frame body.
    #[error("invalid coroutine state: {0}")]
    InvalidState(&'static str),

    /// The frame was already destroyed by its owner.
    #[error("frame has already been destroyed")]
    Destroyed,
}

impl Error {
    pub(crate) fn invalid_resume(frame: FrameId) -> Self {
        Self {
            kind: ErrorKind::InvalidResume,
            frame: Some(frame),
        }
    }

    pub(crate) fn invalid_state(reason: &'static str) -> Self {
        Self {
            kind: ErrorKind::InvalidState(reason),
            frame: None,
        }
    }

    pub(crate) fn destroyed(frame: Option<FrameId>) -> Self {
        Self {
            kind: ErrorKind::Destroyed,
            frame,
        }
    }

    pub(crate) fn on_frame(mut self, frame: FrameId) -> Self {
        self.frame.get_or_insert(frame);
        self
    }

    /// Whether this error was raised by resuming a frame that can no longer run.
    pub fn is_invalid_resume(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidResume)
    }

    /// Whether this error reports a broken protocol rule.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidState(_))
    }
}
