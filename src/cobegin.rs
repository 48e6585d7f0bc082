//! Bulk task launch and join (SPEC_FULL §C, grounded on
//! `examples/original_source/source/src/examples/Cobegin.cc`'s
//! `COBEGIN`/`COEND` and `START`/`WAIT`).
//!
//! The translator lowers a `COBEGIN` block to N task activations followed by
//! a join on all of them, and `START`/`WAIT` to a single activation whose
//! result is fetched later. Both are thin constructor-level conveniences
//! over [`crate::task::Task`] — no new scheduling primitive, matching
//! SPEC_FULL's note that this does not touch the `_Task`/`_Accept`
//! language-syntax Non-goals.

use std::sync::{Arc, Condvar, Mutex as StdMutex};

use crate::cluster::Cluster;
use crate::task::{Task, TaskAttr};

struct JoinBarrier {
    remaining: StdMutex<usize>,
    done: Condvar,
}

impl JoinBarrier {
    fn new(n: usize) -> Self {
        Self { remaining: StdMutex::new(n), done: Condvar::new() }
    }

    fn arrive(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait_all(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.done.wait(remaining).unwrap();
        }
    }
}

/// Run every closure in `bodies` concurrently as a task on `cluster`, block
/// the caller until all have halted, then return (`COBEGIN ... COEND`).
///
/// The caller itself suspends via a condvar rather than a coroutine
/// primitive: `CoBegin` is meant to be callable from ordinary Rust code
/// bootstrapping a cluster, not only from inside a running task.
pub fn cobegin(cluster: &Arc<Cluster>, bodies: Vec<Box<dyn FnOnce() + Send>>) {
    let barrier = Arc::new(JoinBarrier::new(bodies.len()));
    for body in bodies {
        let barrier = Arc::clone(&barrier);
        let task = Task::new(TaskAttr::default(), Arc::clone(cluster), move || {
            body();
            barrier.arrive();
        });
        task.activate().expect("freshly constructed task cannot already be activated");
    }
    barrier.wait_all();
}

/// A handle to a single `START`ed activity, fetched once with [`wait`].
pub struct Started<T> {
    slot: Arc<(StdMutex<Option<T>>, Condvar)>,
}

/// Spawn `body` as a task on `cluster` and return a handle whose result can
/// be collected later with [`wait`] (`START(f, args...)`).
pub fn start<T, F>(cluster: &Arc<Cluster>, body: F) -> Started<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let slot = Arc::new((StdMutex::new(None), Condvar::new()));
    let slot_for_task = Arc::clone(&slot);
    let task = Task::new(TaskAttr::default(), Arc::clone(cluster), move || {
        let result = body();
        let (lock, cv) = &*slot_for_task;
        *lock.lock().unwrap() = Some(result);
        cv.notify_all();
    });
    task.activate().expect("freshly constructed task cannot already be activated");
    Started { slot }
}

/// Block until a `start`ed activity has produced its result, then return it
/// (`WAIT(handle)`). Panics if called twice on the same handle.
pub fn wait<T>(handle: Started<T>) -> T {
    let (lock, cv) = &*handle.slot;
    let mut guard = lock.lock().unwrap();
    while guard.is_none() {
        guard = cv.wait(guard).unwrap();
    }
    guard.take().expect("checked Some above")
}
