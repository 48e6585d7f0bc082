//! Serial: the monitor core (§3 "Serial (monitor)", §4.4).
//!
//! Grounded on `r3_kernel::mutex`'s `lock_mutex`/`unlock_mutex`: ownership
//! is a direct field on a shared, spinlock-guarded record, and release
//! picks the next owner itself rather than unlocking and letting
//! contenders race ("handoff — not re-contention — is the rule", §4.4).
//! `entry_queue`/`accept_signalled` are exposed at `pub(crate)` visibility
//! because [`crate::condition`] and [`crate::accept`] are, in effect, the
//! same monitor-core component split into three files by concern, exactly
//! as `r3_kernel::mutex`/`wait`/`event_group` share state through one
//! kernel-internal module.

use std::sync::Arc;

use crate::collections::{Fifo, LifoStack};
use crate::error::RendezvousError;
use crate::sync::spinlock::{SpinGuard, Spinlock};
use crate::task::{Priority, Task};

pub type MemberId = u32;

pub(crate) struct EntryNode {
    pub task: Arc<Task>,
    pub member: MemberId,
}

pub(crate) struct SerialState {
    pub owner: Option<Arc<Task>>,
    pub mutex_recursion: u32,
    pub entry_queue: Fifo<EntryNode>,
    /// Stack of (task, recursion-to-restore) pairs: owners who executed a
    /// `signal`/accept and are waiting to regain the monitor (§3).
    pub accept_signalled: LifoStack<(Arc<Task>, u32)>,
    /// Tasks parked in an `_Accept` with no immediately-matching caller
    /// (§4.5 "enqueue on the acceptor list"). Checked by `enter()` before
    /// the normal entry-queue path so a call matching a waiting acceptor's
    /// enabled set is handed off directly instead of just queuing.
    pub acceptors: Vec<crate::accept::Acceptor>,
    pub disconnected: bool,
}

/// One per monitored object.
pub struct Serial {
    name: String,
    pub(crate) state: Spinlock<SerialState>,
    /// Optional priority ceiling (§4.3 "the ceiling-priority policy
    /// additionally intercepts monitor entry to boost the holder").
    ceiling: Option<Priority>,
}

impl Serial {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_ceiling(name, None)
    }

    pub fn with_ceiling(name: impl Into<String>, ceiling: Option<Priority>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Spinlock::new(SerialState {
                owner: None,
                mutex_recursion: 0,
                entry_queue: Fifo::new(),
                accept_signalled: LifoStack::new(),
                acceptors: Vec::new(),
                disconnected: false,
            }),
            ceiling,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owned(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn owner_id(&self) -> Option<crate::task::TaskId> {
        self.state.lock().owner.as_ref().map(|t| t.id())
    }

    /// Enter the monitor on behalf of the current task for member
    /// `member`. `recursion_allowed` mirrors the member function's
    /// declared reentrancy (§4.4: "the member permits recursive entry").
    pub fn enter(self: &Arc<Self>, member: MemberId, recursion_allowed: bool) -> Result<(), RendezvousError> {
        let task = crate::task::Task::current().ok_or(RendezvousError::BadContext)?;
        {
            let mut st = self.state.lock();
            if st.disconnected {
                return Err(RendezvousError::Disconnected);
            }
            if let Some(o) = &st.owner {
                if Arc::ptr_eq(o, &task) && recursion_allowed {
                    st.mutex_recursion += 1;
                    return Ok(());
                }
            }
            // A parked acceptor whose enabled set includes `member` takes
            // priority over both the owner-free and normal-queue paths:
            // the caller becomes owner immediately and runs synchronously,
            // while the acceptor is pushed onto `acceptSignalled` to
            // regain ownership once this call exits (§4.5).
            if let Some(pos) = st.acceptors.iter().position(|a| a.enabled.contains(&member)) {
                let acceptor = st.acceptors.remove(pos);
                acceptor.cancel_timeout();
                acceptor.task.set_accepted_call(Some(member));
                st.accept_signalled.push((acceptor.task, acceptor.saved_recursion));
                self.grant_to_caller(&mut st, &task);
                return Ok(());
            }
            match &st.owner {
                None => {
                    self.grant_to_caller(&mut st, &task);
                    return Ok(());
                }
                Some(_) => {
                    st.entry_queue.push_back(EntryNode { task: Arc::clone(&task), member });
                }
            }
        }
        task.mark_blocked_and_suspend();
        let st = self.state.lock();
        let became_owner = st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &task));
        if st.disconnected && !became_owner {
            return Err(RendezvousError::Disconnected);
        }
        Ok(())
    }

    /// Leave the monitor: decrement recursion, and on reaching zero hand
    /// ownership to a signalled owner or the next FIFO entry-queue caller
    /// (§4.4 `exit`).
    pub fn exit(self: &Arc<Self>) {
        let mut st = self.state.lock();
        debug_assert!(st.mutex_recursion > 0, "exit() called without owning the serial");
        st.mutex_recursion -= 1;
        if st.mutex_recursion > 0 {
            return;
        }
        let old_owner = st.owner.take();
        if let Some(old) = &old_owner {
            self.note_release(old);
        }
        if let Some((next, recursion)) = st.accept_signalled.pop() {
            self.install_owner(&mut st, next, recursion);
        } else if let Some(node) = st.entry_queue.pop_front() {
            self.install_owner(&mut st, node.task, 1);
        }
    }

    /// Lower `old`'s active priority after it gives up ownership of a
    /// ceiling-protected serial — used by [`crate::condition`] when a
    /// `wait`/`signalBlock` releases ownership outside of `exit()`.
    pub(crate) fn note_release(&self, old: &Arc<Task>) {
        if let Some(c) = self.ceiling {
            old.lower_after_mutex(c);
        }
    }

    pub(crate) fn install_owner(&self, st: &mut SpinGuard<'_, SerialState>, task: Arc<Task>, recursion: u32) {
        if let Some(c) = self.ceiling {
            task.raise_for_mutex(c);
        }
        st.mutex_recursion = recursion;
        st.owner = Some(Arc::clone(&task));
        task.cluster().make_ready(task);
    }

    /// Grant ownership to the task currently executing `enter()` on its own
    /// call stack: unlike [`Serial::install_owner`] this never parks or
    /// wakes anything through the cluster, since the caller was never
    /// blocked in the first place (§4.4/§4.5: the owner-free and
    /// acceptor-match branches of `enter` both resolve synchronously).
    pub(crate) fn grant_to_caller(&self, st: &mut SpinGuard<'_, SerialState>, task: &Arc<Task>) {
        if let Some(c) = self.ceiling {
            task.raise_for_mutex(c);
        }
        st.owner = Some(Arc::clone(task));
        st.mutex_recursion = 1;
    }

    /// Drain every waiter with `RendezvousError::Disconnected` — called
    /// when the monitored object is destroyed while callers are still
    /// queued (§9: "draining queues on serial destruction").
    pub fn drain_on_destroy(&self) {
        let mut st = self.state.lock();
        st.disconnected = true;
        let cluster_tasks: Vec<Arc<Task>> = st
            .entry_queue
            .iter()
            .map(|n| Arc::clone(&n.task))
            .collect();
        st.entry_queue.retain(|_| false);
        let signalled: Vec<Arc<Task>> = std::iter::from_fn(|| st.accept_signalled.pop())
            .map(|(t, _)| t)
            .collect();
        let acceptors: Vec<Arc<Task>> = st
            .acceptors
            .drain(..)
            .map(|a| {
                a.cancel_timeout();
                a.task
            })
            .collect();
        drop(st);
        for task in cluster_tasks.into_iter().chain(signalled).chain(acceptors) {
            task.cluster().make_ready(task);
        }
    }
}

impl Drop for Serial {
    fn drop(&mut self) {
        if !self.state.lock().disconnected {
            self.drain_on_destroy();
        }
    }
}
