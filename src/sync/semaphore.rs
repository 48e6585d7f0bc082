//! Counting semaphore (§2 "Semaphore & condition-lock").
//!
//! Grounded on `r3_kernel::semaphore`'s `wait`/`signal` pair built over
//! `r3_kernel::wait::WaitQueue`: a count plus a FIFO of parked waiters.
//! Blocking routes through the scheduler the same way `condition.rs`'s
//! `wait`/`signal` do — `task.mark_blocked_and_suspend()`, woken later by
//! `cluster.make_ready()` — rather than parking the caller's OS thread
//! directly on a `Condvar`: a processor dispatches tasks by parking its own
//! dedicated thread inside `coroutine().resume()`, so a task that blocks on
//! a bare OS primitive instead of suspending its coroutine strands that
//! processor with nothing else to dispatch until the semaphore opens.
//! Timeout handling mirrors `accept.rs`'s `accept_start`/`fire_accept_timeout`.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::WaitTimeoutError;
use crate::event::{EventHandle, EventList};
use crate::sync::spinlock::Spinlock;
use crate::task::Task;
use crate::time::{Duration, Instant};

struct Waiter {
    task: Arc<Task>,
    /// `Some(true)` once woken by `v`/`v_n`, `Some(false)` once woken by a
    /// timeout firing first; `None` while still parked.
    resolved: Spinlock<Option<bool>>,
    timeout: Spinlock<Option<(Arc<EventList>, EventHandle)>>,
}

struct Inner {
    count: u32,
    max: u32,
    waiters: VecDeque<Arc<Waiter>>,
}

pub struct Semaphore {
    state: Spinlock<Inner>,
}

impl Semaphore {
    pub fn new(initial: u32, max: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Spinlock::new(Inner { count: initial.min(max), max, waiters: VecDeque::new() }),
        })
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    /// Non-blocking acquire; `true` on success.
    pub fn try_p(&self) -> bool {
        let mut st = self.state.lock();
        if st.count > 0 {
            st.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn p(self: &Arc<Self>) {
        self.p_until(None).expect("non-timed wait cannot time out");
    }

    pub fn p_timeout(self: &Arc<Self>, timeout: Duration) -> Result<(), WaitTimeoutError> {
        let deadline = Instant::now().checked_add(timeout).unwrap_or_else(Instant::now);
        self.p_until(Some(deadline))
    }

    fn p_until(self: &Arc<Self>, deadline: Option<Instant>) -> Result<(), WaitTimeoutError> {
        let task = Task::current().expect("p() called outside a task context");

        let waiter = {
            let mut st = self.state.lock();
            if st.count > 0 {
                st.count -= 1;
                return Ok(());
            }
            let waiter = Arc::new(Waiter {
                task: Arc::clone(&task),
                resolved: Spinlock::new(None),
                timeout: Spinlock::new(None),
            });
            st.waiters.push_back(Arc::clone(&waiter));
            waiter
        };

        if let Some(deadline) = deadline {
            let events = Arc::clone(task.cluster().event_list());
            let sem = Arc::clone(self);
            let waiter_for_timer = Arc::clone(&waiter);
            let handle = events.schedule_at(deadline, false, move || {
                sem.fire_timeout(&waiter_for_timer);
            });
            *waiter.timeout.lock() = Some((events, handle));
        }

        task.mark_blocked_and_suspend();

        match *waiter.resolved.lock() {
            Some(false) => Err(WaitTimeoutError::Timeout),
            Some(true) | None => Ok(()),
        }
    }

    /// Timer callback for an armed `p_timeout`: if `waiter` is still
    /// parked, pull it off the queue and get it running again, mirroring
    /// `accept.rs`'s `fire_accept_timeout`.
    fn fire_timeout(&self, waiter: &Arc<Waiter>) {
        let mut st = self.state.lock();
        let Some(pos) = st.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) else {
            return;
        };
        let found = st.waiters.remove(pos).expect("position was just found");
        drop(st);
        *found.resolved.lock() = Some(false);
        found.task.cluster().make_ready(Arc::clone(&found.task));
    }

    /// Release one unit, waking a single waiter if any are parked.
    pub fn v(&self) {
        self.v_n(1);
    }

    /// Release `n` units at once (used by bounded-buffer style batch
    /// producers). Each unit goes straight to a parked waiter if one is
    /// available; only leftover units are added to `count`, which then
    /// saturates at the semaphore's configured maximum.
    pub fn v_n(&self, n: u32) {
        let mut st = self.state.lock();
        let mut remaining = n;
        while remaining > 0 {
            let Some(waiter) = st.waiters.pop_front() else { break };
            if let Some((events, handle)) = waiter.timeout.lock().take() {
                events.cancel(handle);
            }
            *waiter.resolved.lock() = Some(true);
            waiter.task.cluster().make_ready(Arc::clone(&waiter.task));
            remaining -= 1;
        }
        st.count = (st.count + remaining).min(st.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, FifoPolicy};
    use crate::processor::Processor;
    use crate::task::{Task, TaskAttr};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    #[test]
    fn try_p_respects_count() {
        let sem = Semaphore::new(1, 1);
        assert!(sem.try_p());
        assert!(!sem.try_p());
        sem.v();
        assert!(sem.try_p());
    }

    #[test]
    fn count_saturates_at_max() {
        let sem = Semaphore::new(0, 2);
        sem.v_n(5);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn p_blocks_until_v() {
        let cluster = Cluster::new("sem-test", Box::new(FifoPolicy::new()));
        let _p1 = Processor::spawn(Arc::clone(&cluster));
        let _p2 = Processor::spawn(Arc::clone(&cluster));
        let sem = Semaphore::new(0, 1);
        let log = Arc::new(StdMutex::new(Vec::new()));

        let (s1, l1) = (Arc::clone(&sem), Arc::clone(&log));
        let waiter = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            l1.lock().unwrap().push("waiting");
            s1.p();
            l1.lock().unwrap().push("woke");
        });

        let (s2, l2) = (Arc::clone(&sem), Arc::clone(&log));
        let signaller = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            std::thread::sleep(StdDuration::from_millis(30));
            l2.lock().unwrap().push("signalling");
            s2.v();
        });

        waiter.activate().unwrap();
        signaller.activate().unwrap();
        std::thread::sleep(StdDuration::from_millis(150));
        let trace = log.lock().unwrap().clone();
        assert_eq!(trace, vec!["waiting", "signalling", "woke"]);
    }

    #[test]
    fn p_timeout_expires_without_signal() {
        let cluster = Cluster::new("sem-timeout", Box::new(FifoPolicy::new()));
        let _p = Processor::spawn(Arc::clone(&cluster));
        let sem = Semaphore::new(0, 1);
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (s1, l1) = (Arc::clone(&sem), Arc::clone(&log));
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            let res = s1.p_timeout(Duration::from_millis(20));
            l1.lock().unwrap().push(res == Err(WaitTimeoutError::Timeout));
        });
        task.activate().unwrap();
        std::thread::sleep(StdDuration::from_millis(120));
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }

    #[test]
    fn one_signaller_wakes_exactly_one_waiter() {
        let cluster = Cluster::new("sem-fifo", Box::new(FifoPolicy::new()));
        let _p1 = Processor::spawn(Arc::clone(&cluster));
        let _p2 = Processor::spawn(Arc::clone(&cluster));
        let _p3 = Processor::spawn(Arc::clone(&cluster));
        let sem = Semaphore::new(0, 1);
        let woke = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..2 {
            let s = Arc::clone(&sem);
            let w = Arc::clone(&woke);
            let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
                s.p();
                w.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
            task.activate().unwrap();
        }
        std::thread::sleep(StdDuration::from_millis(30));
        sem.v();
        std::thread::sleep(StdDuration::from_millis(60));
        assert_eq!(woke.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
