//! Condition variable belonging to a serial (§3 "Condition variable",
//! §4.4 "Condition variables").
//!
//! A condition's own waiter queue is a separate [`Spinlock`] from its
//! serial's, but every operation here takes the serial's lock first and
//! holds it across the condition-queue mutation *and* the ownership
//! handoff, so the two are atomic together — satisfying §4.4's "`wait`
//! atomically releases the serial and blocks" without literally storing
//! the queue inside `SerialState`. Grounded on `r3_kernel::wait`'s
//! `WaitQueue::wait`, which is likewise called with the owning object's
//! lock already held. The timed variant mirrors `accept.rs`'s
//! `accept_start`/`fire_accept_timeout` arm/cancel/fire pattern.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::RendezvousError;
use crate::event::{EventHandle, EventList};
use crate::serial::Serial;
use crate::sync::spinlock::Spinlock;
use crate::task::Task;
use crate::time::{Duration, Instant};

struct Waiter {
    task: Arc<Task>,
    saved_recursion: u32,
    info: Option<u64>,
    /// `Some(true)` once woken by `signal`/`signal_block`/`broadcast`,
    /// `Some(false)` once woken by a timeout firing first, `None` while
    /// still queued.
    resolved: Spinlock<Option<bool>>,
    timeout: Spinlock<Option<(Arc<EventList>, EventHandle)>>,
}

pub struct Condition {
    serial: Arc<Serial>,
    queue: Spinlock<VecDeque<Arc<Waiter>>>,
}

impl Condition {
    pub fn new(serial: Arc<Serial>) -> Arc<Self> {
        Arc::new(Self { serial, queue: Spinlock::new(VecDeque::new()) })
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Peek the info word of the longest-waiting task, if any, without
    /// waking it (§3: "returned by `front()`").
    pub fn front(&self) -> Option<u64> {
        self.queue.lock().front().and_then(|w| w.info)
    }

    /// Block the caller on this condition, releasing the serial (handed
    /// off to a signalled owner or the next entry-queue caller) and
    /// restoring ownership with the saved recursion depth on wake.
    pub fn wait(self: &Arc<Self>, info: Option<u64>) -> Result<(), RendezvousError> {
        self.wait_until(info, None)
    }

    /// As [`Condition::wait`], but returns `Err(RendezvousError::Timeout)`
    /// if no `signal`/`signal_block`/`broadcast` arrives within `duration`,
    /// arming an event-list timeout the same way `accept_start` does for
    /// `_Accept ... _Timeout`.
    pub fn wait_timeout(self: &Arc<Self>, info: Option<u64>, duration: Duration) -> Result<(), RendezvousError> {
        let deadline = Instant::now().checked_add(duration).unwrap_or_else(Instant::now);
        self.wait_until(info, Some(deadline))
    }

    fn wait_until(self: &Arc<Self>, info: Option<u64>, deadline: Option<Instant>) -> Result<(), RendezvousError> {
        let task = Task::current().ok_or(RendezvousError::BadContext)?;

        let waiter = {
            let mut st = self.serial.state.lock();
            let owns = st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &task));
            if !owns {
                crate::uc_abort!("wait() called without owning serial `{}`", self.serial.name());
            }
            let saved_recursion = st.mutex_recursion;
            let waiter = Arc::new(Waiter {
                task: Arc::clone(&task),
                saved_recursion,
                info,
                resolved: Spinlock::new(None),
                timeout: Spinlock::new(None),
            });
            self.queue.lock().push_back(Arc::clone(&waiter));

            let old_owner = st.owner.take();
            if let Some(old) = &old_owner {
                self.serial.note_release(old);
            }
            if let Some((next, recursion)) = st.accept_signalled.pop() {
                self.serial.install_owner(&mut st, next, recursion);
            } else if let Some(node) = st.entry_queue.pop_front() {
                self.serial.install_owner(&mut st, node.task, 1);
            } else {
                st.mutex_recursion = 0;
            }
            waiter
        };

        if let Some(deadline) = deadline {
            let events = Arc::clone(task.cluster().event_list());
            let cond = Arc::clone(self);
            let waiter_for_timer = Arc::clone(&waiter);
            let handle = events.schedule_at(deadline, false, move || {
                cond.fire_timeout(&waiter_for_timer);
            });
            *waiter.timeout.lock() = Some((events, handle));
        }

        task.mark_blocked_and_suspend();

        let st = self.serial.state.lock();
        if st.disconnected && !st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &task)) {
            return Err(RendezvousError::Disconnected);
        }
        drop(st);

        match *waiter.resolved.lock() {
            Some(false) => Err(RendezvousError::Timeout),
            Some(true) | None => Ok(()),
        }
    }

    /// Cancel `waiter`'s armed timeout (if any) and mark it resolved with
    /// `value` — called both when a real signal reaches it and, with
    /// `false`, from [`Condition::fire_timeout`] itself.
    fn resolve(&self, waiter: &Arc<Waiter>, value: bool) {
        if let Some((events, handle)) = waiter.timeout.lock().take() {
            events.cancel(handle);
        }
        *waiter.resolved.lock() = Some(value);
    }

    /// Timer callback for an armed `wait_timeout`: if `waiter` is still
    /// queued, pull it off and get it running again, respecting mutual
    /// exclusion rather than forcing it Ready unconditionally (mirrors
    /// `accept.rs`'s `fire_accept_timeout`).
    fn fire_timeout(self: &Arc<Self>, waiter: &Arc<Waiter>) {
        let removed = {
            let mut q = self.queue.lock();
            q.iter()
                .position(|w| Arc::ptr_eq(w, waiter))
                .map(|pos| q.remove(pos).expect("position was just found"))
        };
        let Some(found) = removed else { return };
        *found.resolved.lock() = Some(false);
        let task = Arc::clone(&found.task);
        let mut st = self.serial.state.lock();
        if st.owner.is_none() {
            self.serial.install_owner(&mut st, task, found.saved_recursion);
        } else {
            st.entry_queue.push_back(crate::serial::EntryNode { task, member: 0 });
        }
    }

    /// Dequeue the oldest waiter and push it onto the serial's
    /// `acceptSignalled` stack; the signaller keeps running as owner
    /// (§4.4: "LIFO by default for `signal()`").
    pub fn signal(&self) {
        let Some(waiter) = self.queue.lock().pop_front() else { return };
        self.resolve(&waiter, true);
        let mut st = self.serial.state.lock();
        st.accept_signalled.push((Arc::clone(&waiter.task), waiter.saved_recursion));
    }

    /// Hand ownership to the oldest waiter immediately; the caller blocks
    /// in its place on the `acceptSignalled` stack (§4.4 `signalBlock`,
    /// FIFO wakeup order).
    pub fn signal_block(self: &Arc<Self>) -> Result<(), RendezvousError> {
        let task = Task::current().ok_or(RendezvousError::BadContext)?;
        let Some(waiter) = self.queue.lock().pop_front() else { return Ok(()) };
        self.resolve(&waiter, true);
        {
            let mut st = self.serial.state.lock();
            let saved_recursion = st.mutex_recursion;
            if let Some(owner) = &st.owner {
                self.serial.note_release(owner);
            }
            st.accept_signalled.push((Arc::clone(&task), saved_recursion));
            self.serial.install_owner(&mut st, Arc::clone(&waiter.task), waiter.saved_recursion);
        }
        task.mark_blocked_and_suspend();
        Ok(())
    }

    /// Signal every waiting task (§4.4 `broadcast`).
    pub fn broadcast(&self) {
        let waiters: Vec<Arc<Waiter>> = self.queue.lock().drain(..).collect();
        if waiters.is_empty() {
            return;
        }
        let mut st = self.serial.state.lock();
        for w in waiters {
            self.resolve(&w, true);
            st.accept_signalled.push((Arc::clone(&w.task), w.saved_recursion));
        }
    }
}
