//! §8 scenario: asynchronous resume. Task A installs a resumption handler
//! for `E`, enables delivery, and polls; task B calls `ResumeAt(A, E)`.
//! A's handler must run exactly once at its next poll point and A must
//! continue normally afterward.

use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use ucxx::cluster::{Cluster, FifoPolicy};
use ucxx::exception::{catch_resume, enable, poll, resume_at};
use ucxx::processor::Processor;
use ucxx::task::{Task, TaskAttr};

struct Ping(u32);

#[test]
fn handler_runs_exactly_once_and_task_continues() {
    let cluster = Cluster::new("async-resume-cluster", Box::new(FifoPolicy::new()));
    let _p1 = Processor::spawn(Arc::clone(&cluster));
    let _p2 = Processor::spawn(Arc::clone(&cluster));

    let handler_calls = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(StdMutex::new(Vec::<&'static str>::new()));
    let task_ready = Arc::new(std::sync::Barrier::new(2));

    let handler_calls_a = Arc::clone(&handler_calls);
    let log_a = Arc::clone(&log);
    let task_ready_a = Arc::clone(&task_ready);

    let a = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
        log_a.lock().unwrap().push("started");
        enable(&[TypeId::of::<Ping>()], || {
            catch_resume::<Ping, _>(
                {
                    let handler_calls = Arc::clone(&handler_calls_a);
                    let log = Arc::clone(&log_a);
                    move |p: &Ping| {
                        handler_calls.fetch_add(1, Ordering::SeqCst);
                        log.lock().unwrap().push("handled");
                        assert_eq!(p.0, 99);
                    }
                },
                || {
                    task_ready_a.wait();
                    // Poll repeatedly until B's `ResumeAt` lands in the mailbox.
                    for _ in 0..200 {
                        poll();
                        if handler_calls_a.load(Ordering::SeqCst) > 0 {
                            break;
                        }
                        std::thread::sleep(std::time::Duration::from_millis(5));
                    }
                },
            );
        });
        log_a.lock().unwrap().push("continued");
    });
    a.activate().unwrap();

    let a_for_b = Arc::clone(&a);
    let b = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
        task_ready.wait();
        resume_at(&a_for_b, Ping(99));
    });
    b.activate().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(500));

    assert_eq!(handler_calls.load(Ordering::SeqCst), 1, "handler must run exactly once");
    let trace = log.lock().unwrap().clone();
    assert_eq!(trace, vec!["started", "handled", "continued"]);
}
