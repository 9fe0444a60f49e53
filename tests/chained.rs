//! Tasks awaiting other tasks
use coroutine_rt::{Awaitable, FrameState, Handle, Suspension, Task, block_on};
use simple_test_case::test_case;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

#[derive(Debug, Clone, PartialEq)]
struct Boom(&'static str);

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn chain(depth: u32) -> Task<u32> {
    Task::new(async move {
        if depth == 0 {
            return Ok(0);
        }
        let below = chain(depth - 1).await?;

        Ok(below + 1)
    })
}

#[test_case(1; "single level")]
#[test_case(100; "shallow")]
#[test_case(10_000; "deep")]
#[test]
fn chains_complete_in_constant_stack(depth: u32) {
    // a chain that nested a call per level would overflow this stack long before 10k levels
    let res = thread::Builder::new()
        .stack_size(128 * 1024)
        .spawn(move || block_on(chain(depth)))
        .unwrap()
        .join()
        .unwrap();

    assert_eq!(res, Ok(depth));
}

#[test]
fn errors_reach_the_awaiter_unchanged() {
    let failing: Task<u32, Boom> = Task::new(async { Err(Boom("disk on fire")) });
    let awaiter: Task<u32, Boom> = Task::new(async move {
        let n = failing.await?;
        Ok(n + 1)
    });

    assert_eq!(block_on(awaiter), Err(Boom("disk on fire")));
}

#[test]
fn errors_propagate_through_every_level() {
    fn level(depth: u32) -> Task<u32, Boom> {
        Task::new(async move {
            if depth == 0 {
                return Err(Boom("bottom"));
            }
            level(depth - 1).await
        })
    }

    assert_eq!(block_on(level(50)), Err(Boom("bottom")));
}

#[test]
fn awaiters_resume_even_if_they_ignore_the_error() {
    let failing: Task<u32, Boom> = Task::new(async { Err(Boom("ignored")) });
    let awaiter: Task<&'static str, Boom> = Task::new(async move {
        let _ = failing.await;
        Ok("carried on")
    });

    assert_eq!(block_on(awaiter), Ok("carried on"));
}

#[test]
fn awaited_tasks_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let step = |name: &'static str, log: Arc<Mutex<Vec<&'static str>>>| -> Task<()> {
        Task::new(async move {
            log.lock().unwrap().push(name);
            Ok(())
        })
    };

    let (a, b, c) = (
        step("a", log.clone()),
        step("b", log.clone()),
        step("c", log.clone()),
    );
    let outer_log = log.clone();
    let outer: Task<()> = Task::new(async move {
        outer_log.lock().unwrap().push("start");
        c.await?;
        a.await?;
        b.await?;
        outer_log.lock().unwrap().push("end");
        Ok(())
    });

    block_on(outer).unwrap();
    assert_eq!(*log.lock().unwrap(), ["start", "c", "a", "b", "end"]);
}

#[test]
fn awaiting_an_already_completed_task_does_not_suspend() {
    let done: Task<u32> = Task::new(async { Ok(5) });
    done.start().unwrap();
    assert!(done.ready());

    let awaiter: Task<u32> = Task::new(async move { Ok(done.await? * 2) });

    assert_eq!(block_on(awaiter), Ok(10));
}

#[test]
fn started_tasks_resume_their_awaiter_on_completion() {
    let mut awaited: Task<u32> = Task::new(async { Ok(3) });
    let awaiter: Task<u32> = Task::new(async { Ok(4) });

    // register by hand so the completion has somewhere to go
    assert!(matches!(
        awaited.suspend(awaiter.handle()),
        Ok(Suspension::Transfer(_))
    ));
    awaited.start().unwrap();

    assert!(awaited.is_done());
    assert!(awaiter.is_done());
    assert_eq!(awaited.try_result(), Ok(Ok(3)));
}

#[test]
fn dropping_an_unfinished_task_releases_its_locals() {
    let drops = Arc::new(AtomicUsize::new(0));
    let guard = DropCounter(drops.clone());
    let task: Task<()> = Task::new(async move {
        let _guard = guard;
        Ok(())
    });
    assert_eq!(task.state(), FrameState::Created);

    drop(task);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn moving_a_task_keeps_a_single_owner() {
    let drops = Arc::new(AtomicUsize::new(0));
    let guard = DropCounter(drops.clone());
    let task: Task<u32> = Task::new(async move {
        let _guard = guard;
        Ok(1)
    });
    let handle = task.handle();

    let mut moved = Some(task);
    let task = moved.take().unwrap();
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    assert_eq!(block_on(task), Ok(1));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), FrameState::Destroyed);
}

// Captures the continuation of whoever awaits it and never suspends.
struct Snoop(Arc<Mutex<Option<Handle>>>);

impl Awaitable for Snoop {
    type Output = ();

    fn ready(&self) -> bool {
        false
    }

    fn suspend(&mut self, continuation: Handle) -> coroutine_rt::Result<Suspension> {
        *self.0.lock().unwrap() = Some(continuation);
        Ok(Suspension::Ready)
    }

    fn resume(&mut self) {}
}

#[test]
fn resuming_a_running_frame_is_rejected() {
    let slot = Arc::new(Mutex::new(None));
    let snoop = Snoop(slot.clone());
    let task: Task<bool> = Task::new(async move {
        snoop.into_await().await;
        let own: Handle = slot.lock().unwrap().take().unwrap();
        let err = own.resume().unwrap_err();

        Ok(err.is_invalid_state())
    });

    assert_eq!(block_on(task), Ok(true));
}

#[test]
fn destroying_a_running_frame_is_rejected() {
    let slot = Arc::new(Mutex::new(None));
    let snoop = Snoop(slot.clone());
    let task: Task<bool> = Task::new(async move {
        snoop.into_await().await;
        let own: Handle = slot.lock().unwrap().take().unwrap();
        let err = own.destroy().unwrap_err();

        Ok(err.is_invalid_state() && own.state() == FrameState::Running)
    });

    assert_eq!(block_on(task), Ok(true));
}

#[test]
fn panicking_bodies_fail_the_frame() {
    let explode = Arc::new(AtomicBool::new(true));
    let task: Task<u32> = Task::new(async move {
        if explode.load(Ordering::SeqCst) {
            panic!("task body exploded");
        }
        Ok(1)
    });
    let handle = task.handle();

    let res = panic::catch_unwind(AssertUnwindSafe(|| task.start()));

    assert!(res.is_err());
    assert_eq!(task.state(), FrameState::Failed);
    assert!(handle.resume().unwrap_err().is_invalid_resume());
}
