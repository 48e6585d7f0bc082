//! §8 scenario: sleep correctness — a task's `uSleep`-equivalent wait is
//! monotonic and bounded by a small scheduling-slack allowance.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration as StdDuration, Instant as StdInstant};

use ucxx::cluster::{Cluster, FifoPolicy};
use ucxx::processor::Processor;
use ucxx::task::{Task, TaskAttr};
use ucxx::time::Duration;

#[test]
fn sleeping_task_wakes_after_at_least_the_requested_duration() {
    let cluster = Cluster::new("sleep-cluster", Box::new(FifoPolicy::new()));
    let _p = Processor::spawn(Arc::clone(&cluster));

    let elapsed = Arc::new(StdMutex::new(None));
    let elapsed2 = Arc::clone(&elapsed);

    let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
        let task = Task::current().expect("running inside a task");
        let start = StdInstant::now();
        task.sleep(Duration::from_secs(1));
        *elapsed2.lock().unwrap() = Some(start.elapsed());
    });
    task.activate().unwrap();

    let deadline = StdInstant::now() + StdDuration::from_secs(5);
    while elapsed.lock().unwrap().is_none() && StdInstant::now() < deadline {
        std::thread::sleep(StdDuration::from_millis(10));
    }

    let measured = elapsed.lock().unwrap().expect("task should have woken within the deadline");
    assert!(measured >= StdDuration::from_secs(1), "woke too early: {measured:?}");
    assert!(
        measured <= StdDuration::from_millis(1050),
        "scheduling slack exceeded the 50ms bound: {measured:?}"
    );
}
