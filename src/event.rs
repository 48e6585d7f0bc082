//! Per-cluster sorted event list and timer (§3 "Event node", §4.7).
//!
//! Grounded on the *role* of `r3_kernel::timeout`/`timer`: a sorted list of
//! timed callbacks plus one timer driving the earliest entry. The teacher
//! arms a hardware/port timer interrupt; this hosted crate instead runs one
//! dedicated timer thread per cluster that parks on a condvar until the
//! nearest wake time (or is woken early by a fresher insertion), matching
//! the "single OS timer, re-armed each time" behaviour (§4.7) with a
//! thread in place of a hardware interrupt.

use crate::collections::EventQueue as TimeQueue;
use crate::sync::spinlock::Spinlock;
use crate::time::{Duration, Instant};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex as StdMutex};
use std::thread::{self, JoinHandle};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EventHandle(u64);

type Handler = Box<dyn FnOnce() + Send>;

struct Entry {
    id: u64,
    handler: Spinlock<Option<Handler>>,
    /// §4.7: "for nodes with `executeLocked`, the handler is invoked with
    /// the cluster spinlock still held" — used by semaphore/condition
    /// timeouts that must remove the waiter atomically with firing.
    execute_locked: bool,
}

struct State {
    queue: TimeQueue<std::sync::Arc<Entry>>,
}

pub struct EventList {
    state: Spinlock<State>,
    wake_gen: StdMutex<u64>,
    cv: Condvar,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    timer_thread: Spinlock<Option<JoinHandle<()>>>,
}

impl EventList {
    pub fn new() -> std::sync::Arc<Self> {
        let this = std::sync::Arc::new(Self {
            state: Spinlock::new(State { queue: TimeQueue::new() }),
            wake_gen: StdMutex::new(0),
            cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            timer_thread: Spinlock::new(None),
        });
        let driver = std::sync::Arc::clone(&this);
        let handle = thread::Builder::new()
            .name("uc-event-timer".into())
            .spawn(move || driver.run())
            .expect("failed to spawn event timer thread");
        *this.timer_thread.lock() = Some(handle);
        this
    }

    /// Schedule `handler` to run at `deadline`. Returns a handle usable with
    /// [`EventList::cancel`].
    pub fn schedule_at(&self, deadline: Instant, execute_locked: bool, handler: impl FnOnce() + Send + 'static) -> EventHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = std::sync::Arc::new(Entry {
            id,
            handler: Spinlock::new(Some(Box::new(handler))),
            execute_locked,
        });
        {
            let mut st = self.state.lock();
            st.queue.insert(deadline.as_nanos_since_process_epoch(), entry);
        }
        self.bump_and_notify();
        EventHandle(id)
    }

    pub fn schedule_after(&self, delay: Duration, execute_locked: bool, handler: impl FnOnce() + Send + 'static) -> EventHandle {
        let deadline = Instant::now().checked_add(delay).unwrap_or(Instant::now());
        self.schedule_at(deadline, execute_locked, handler)
    }

    /// Cancel a not-yet-fired event. Returns `true` if it was still pending.
    pub fn cancel(&self, handle: EventHandle) -> bool {
        let removed = {
            let mut st = self.state.lock();
            st.queue.remove(|e| e.id == handle.0)
        };
        self.bump_and_notify();
        removed.is_some()
    }

    fn bump_and_notify(&self) {
        let mut g = self.wake_gen.lock().unwrap();
        *g = g.wrapping_add(1);
        self.cv.notify_one();
    }

    fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let next_nanos = { self.state.lock().queue.peek_time() };
            let guard = self.wake_gen.lock().unwrap();
            let (guard, _) = match next_nanos {
                None => (self.cv.wait(guard).unwrap(), false),
                Some(nanos) => {
                    let now = Instant::now().as_nanos_since_process_epoch();
                    if nanos <= now {
                        (guard, false)
                    } else {
                        let remaining = std::time::Duration::from_nanos((nanos - now).min(u64::MAX as u128) as u64);
                        let (g, res) = self.cv.wait_timeout(guard, remaining).unwrap();
                        (g, res.timed_out())
                    }
                }
            };
            drop(guard);
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            self.fire_due();
        }
    }

    fn fire_due(&self) {
        let now = Instant::now().as_nanos_since_process_epoch();
        loop {
            let mut st = self.state.lock();
            let Some(entry) = st.queue.pop_if_due(now) else { break };
            if entry.execute_locked {
                // Invoked while `st` is still held, so removal from the
                // queue and the handler's own state mutation happen
                // atomically together (§4.7 "executeLocked").
                if let Some(handler) = entry.handler.lock().take() {
                    handler();
                }
            } else {
                drop(st);
                if let Some(handler) = entry.handler.lock().take() {
                    handler();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.bump_and_notify();
    }
}

impl Drop for EventList {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.timer_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
