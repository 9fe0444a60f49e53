//! A shared timer thread and the [Delay] awaitable built on it.
//!
//! This is an example of an external collaborator for the [Awaitable] protocol: the delay hands
//! its continuation to the timer thread, which resumes it once the deadline has passed. All
//! delays created from the same [Timer] share one thread.
use crate::{
    awaitable::{Await, Awaitable, Suspension},
    error::{Error, Result},
    handle::Handle,
};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt,
    future::IntoFuture,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

struct Entry {
    deadline: Instant,
    seq: u64,
    continuation: Handle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, deadline: Instant, continuation: Handle) -> Result<()> {
        let mut queue = self.lock();
        if queue.shutdown {
            return Err(Error::invalid_state("delay awaited after its timer shut down"));
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        trace!(continuation = %continuation.id(), seq, "scheduling timer entry");
        queue.entries.push(Reverse(Entry {
            deadline,
            seq,
            continuation,
        }));
        drop(queue);
        self.cond.notify_one();

        Ok(())
    }

    fn run(&self) {
        let mut queue = self.lock();
        loop {
            if queue.shutdown {
                debug!(dropped = queue.entries.len(), "timer shutting down");
                return;
            }

            let now = Instant::now();
            let next = queue.entries.peek().map(|Reverse(entry)| entry.deadline);
            match next {
                Some(deadline) if deadline <= now => {
                    if let Some(Reverse(entry)) = queue.entries.pop() {
                        // resume outside of the lock: the continuation may schedule again
                        drop(queue);
                        fire(entry);
                        queue = self.lock();
                    }
                }

                Some(deadline) => {
                    queue = self
                        .cond
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }

                None => {
                    queue = self.cond.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

fn fire(entry: Entry) {
    let id = entry.continuation.id();
    trace!(continuation = %id, "timer expired");
    match panic::catch_unwind(AssertUnwindSafe(|| entry.continuation.resume())) {
        Ok(Ok(())) => (),
        Ok(Err(err)) => warn!(continuation = %id, %err, "timer failed to resume continuation"),
        // the frame has already been marked as failed
        Err(_) => warn!(continuation = %id, "continuation panicked on the timer thread"),
    }
}

/// Configuration for a [Timer].
#[derive(Debug, Default, Clone)]
pub struct TimerBuilder {
    name: Option<String>,
}

impl TimerBuilder {
    /// A builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the timer thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn the timer thread.
    ///
    /// # Errors
    /// Returns the error from spawning the thread.
    pub fn spawn(self) -> io::Result<Timer> {
        let shared = Arc::new(Shared::default());
        let worker = shared.clone();
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        let thread = builder.spawn(move || worker.run())?;

        Ok(Timer {
            shared,
            thread: Some(thread),
        })
    }
}

/// Owner of a timer thread that resumes continuations once their deadline passes.
///
/// Dropping the timer stops and joins the thread. Continuations still waiting at that point are
/// never resumed.
pub struct Timer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Timer {
    /// Spawn a timer with the default configuration.
    ///
    /// # Errors
    /// Returns the error from spawning the thread.
    pub fn new() -> io::Result<Self> {
        TimerBuilder::new().spawn()
    }

    /// Configure a new timer.
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }

    /// An awaitable that completes `duration` after it first suspends.
    pub fn delay(&self, duration: Duration) -> Delay {
        Delay {
            shared: self.shared.clone(),
            duration,
        }
    }

    /// The number of continuations waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.lock().entries.len()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cond.notify_all();
        let Some(thread) = self.thread.take() else {
            return;
        };
        // dropped by a continuation running on the timer thread itself
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!("timer thread panicked");
        }
    }
}

/// An [Awaitable] that suspends the awaiting task for a fixed duration.
///
/// A zero duration never suspends.
pub struct Delay {
    shared: Arc<Shared>,
    duration: Duration,
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delay")
            .field("duration", &self.duration)
            .finish()
    }
}

impl Awaitable for Delay {
    type Output = ();

    fn ready(&self) -> bool {
        self.duration.is_zero()
    }

    /// A duration too long to represent as a deadline parks the awaiting frame for good.
    fn suspend(&mut self, continuation: Handle) -> Result<Suspension> {
        match Instant::now().checked_add(self.duration) {
            Some(deadline) => self.shared.schedule(deadline, continuation)?,
            None => trace!(continuation = %continuation.id(), "delay never expires"),
        }

        Ok(Suspension::Park)
    }

    fn resume(&mut self) {}
}

impl IntoFuture for Delay {
    type Output = ();
    type IntoFuture = Await<Self>;

    fn into_future(self) -> Self::IntoFuture {
        self.into_await()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameState, Task};

    fn idle_task() -> Task<()> {
        Task::new(async { Ok(()) })
    }

    #[test]
    fn entries_fire_in_deadline_order() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        for (seq, offset) in [(0, 30), (1, 10), (2, 20), (3, 10)] {
            heap.push(Reverse(Entry {
                deadline: now + Duration::from_millis(offset),
                seq,
                continuation: idle_task().handle(),
            }));
        }

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.seq)).collect();

        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn delays_after_shutdown_are_rejected() {
        let timer = Timer::new().unwrap();
        let mut delay = timer.delay(Duration::from_millis(5));
        drop(timer);

        let task = idle_task();
        assert!(delay.suspend(task.handle()).unwrap_err().is_invalid_state());
    }

    #[test]
    fn zero_delays_are_ready() {
        let timer = Timer::builder().name("zero-delay").spawn().unwrap();

        assert!(timer.delay(Duration::ZERO).ready());
        assert!(!timer.delay(Duration::from_millis(1)).ready());
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn unrepresentable_deadlines_park_forever() {
        let timer = Timer::new().unwrap();
        let delay = timer.delay(Duration::MAX);
        let task: Task<()> = Task::new(async move {
            delay.await;
            Ok(())
        });

        task.start().unwrap();

        assert_eq!(task.state(), FrameState::Suspended);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn panicking_continuations_do_not_stop_the_timer() {
        let timer = Timer::new().unwrap();
        let explode = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let short = timer.delay(Duration::from_millis(5));
        let failing: Task<()> = Task::new(async move {
            short.await;
            if explode.load(std::sync::atomic::Ordering::SeqCst) {
                panic!("task body exploded");
            }
            Ok(())
        });
        let long = timer.delay(Duration::from_millis(30));
        let healthy: Task<u8> = Task::new(async move {
            long.await;
            Ok(1)
        });

        failing.start().unwrap();
        healthy.start().unwrap();

        let give_up = Instant::now() + Duration::from_secs(5);
        while !healthy.is_done() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(failing.state(), FrameState::Failed);
        assert_eq!(healthy.state(), FrameState::Completed);
        assert_eq!(timer.pending(), 0);
    }
}
