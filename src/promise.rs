//! The lifecycle hooks a frame body uses to communicate with its owner.
use crate::handle::Handle;

/// Which suspension points a frame body is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The body suspends only at [Co::yield_value][crate::Co::yield_value].
    Generator,
    /// The body suspends only by awaiting an [Awaitable][crate::Awaitable].
    Task,
}

/// The object embedded in a [Frame][crate::Frame] that receives yielded values, the final
/// result or the body's error, and decides what happens when the body finishes.
///
/// [Frame::create][crate::Frame::create] plays the part of the creation hook and never runs the
/// body: every frame suspends at its start point.
pub trait Promise: Send + Sync + 'static {
    /// The type of value the body may yield.
    type Yield: Send + 'static;
    /// The value produced when the body returns `Ok`.
    type Value: Send + 'static;
    /// The error produced when the body returns `Err`.
    type Error: Send + 'static;

    /// The kind of frame this promise drives.
    const KIND: FrameKind;

    /// Store a yielded value. The frame suspends once this returns.
    fn on_yield(&self, value: Self::Yield);

    /// Store the final result of a body that completed normally.
    fn on_return(&self, value: Self::Value);

    /// Capture an error returned by the body instead of letting it escape the runtime.
    fn on_unhandled_error(&self, error: Self::Error);

    /// Called once the body has finished and the frame is parked for good.
    ///
    /// The returned handle, if any, is resumed immediately by the same resume loop before
    /// control returns to the caller.
    fn final_suspend(&self) -> Option<Handle>;
}
