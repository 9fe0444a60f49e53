//! A cooperative coroutine runtime built by (ab)using async/await state machines.
//!
//! The building blocks are:
//!   - [Frame]: the heap allocated state of one coroutine invocation, owned by a [FrameBox]
//!   - [Handle]: a non-owning reference used to resume, query or destroy a frame
//!   - [Promise]: the hooks a frame body uses to hand values and errors to its owner
//!   - [Generator]: a lazy, pull based, single pass sequence
//!   - [Task]: a lazily started computation that resumes its awaiter when it completes
//!   - [Awaitable]: the ready / suspend / resume protocol that tasks and custom suspension
//!     points such as [Delay] implement
//!
//! Frame bodies are plain `async` blocks, but they may only suspend on the runtime's own
//! futures: [Co::yield_value] inside a generator and [Await] (or `.await` on a [Task] or
//! [Delay]) inside a task. Awaiting anything else is reported as a contract violation.
//!
//! Awaiting a task hands control straight to it and its completion hands control straight
//! back, from a loop rather than through nested calls, so arbitrarily deep chains of tasks run
//! in constant stack space.
#![warn(
    clippy::complexity,
    clippy::correctness,
    clippy::style,
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    rustdoc::all,
    clippy::undocumented_unsafe_blocks
)]

mod awaitable;
mod error;
mod frame;
mod generator;
mod handle;
mod promise;
mod task;
mod timer;

pub use awaitable::{Await, Awaitable, Suspension};
pub use error::{Error, ErrorKind, Result};
pub use frame::{Frame, FrameBox, FrameId, FrameState};
pub use generator::{Co, Generator, GeneratorPromise};
pub use handle::Handle;
pub use promise::{FrameKind, Promise};
pub use task::{Task, TaskPromise, block_on};
pub use timer::{Delay, Timer, TimerBuilder};
