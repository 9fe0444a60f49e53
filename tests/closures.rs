//! Generators and tasks built from closures
use coroutine_rt::{Co, Generator, Task, block_on};
use std::{convert::Infallible, sync::Arc};

#[test]
fn generator_from_closure_works() {
    let mut g: Generator<&'static str> = Generator::from(async |co: Co<&'static str>| {
        co.yield_value("ping").await;
        co.yield_value("pong").await;
        Ok(())
    });

    assert_eq!(g.next(), Some(Ok("ping")));
    assert_eq!(g.next(), Some(Ok("pong")));
    assert_eq!(g.next(), None);
}

#[test]
fn closures_capturing_shared_state_work() {
    fn doubled(nums: Arc<[usize]>) -> Generator<usize> {
        Generator::new(move |co: Co<usize>| async move {
            for &n in nums.iter() {
                co.yield_value(n * 2).await;
            }
            Ok(())
        })
    }

    let nums: Arc<[usize]> = Arc::from(vec![1, 2, 3]);
    let values: Vec<usize> = doubled(nums.clone()).into_values().collect();

    assert_eq!(values, [2, 4, 6]);
    assert_eq!(Arc::strong_count(&nums), 1);
}

#[test]
fn task_from_fn_defers_building_the_body() {
    let words = vec!["hello", "world"];
    let task: Task<String, Infallible> = Task::from_fn(move || async move { Ok(words.join(" ")) });

    assert_eq!(block_on(task), Ok("hello world".to_string()));
}
