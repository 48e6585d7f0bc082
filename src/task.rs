//! Task: a Coroutine plus a thread-of-control known to a cluster's
//! scheduler (§3 "Task").
//!
//! Grounded almost directly on `r3_kernel::task`'s `TaskCb`: a task record
//! holds a priority, an active (boosted) priority, the cluster it
//! currently belongs to, and a slot for the currently-accepted mutex
//! member call. Here the coroutine/stack machinery is delegated entirely
//! to [`crate::coroutine::Coroutine`] — a task *is* a coroutine with
//! scheduling metadata bolted on, matching §9's "coroutine has no
//! scheduling record of its own; a task does."

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::cluster::Cluster;
use crate::coroutine::Coroutine;
use crate::error::{ActivateTaskError, SetTaskPriorityError};
use crate::processor::{Processor, ProcessorId};
use crate::sync::spinlock::Spinlock;

pub type TaskId = u64;
pub type Priority = i32;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct TaskAttr {
    pub name: String,
    pub stack_size: usize,
    pub priority: Priority,
    /// Restricts dispatch to one processor (§3 task data model, §4.3
    /// migrate: "the only way for a task to change processors on a
    /// bound-processor setup"). `None` means any processor on the cluster
    /// may run it.
    pub bound_processor: Option<ProcessorId>,
}

impl Default for TaskAttr {
    fn default() -> Self {
        Self {
            name: "task".into(),
            stack_size: crate::config::config().default_stack_size,
            priority: 0,
            bound_processor: None,
        }
    }
}

/// What the processor kernel loop should do once a task's `resume()`
/// returns control to it (§4.2 item 4).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PostResumeStatus {
    /// Runnable again; the processor re-enqueues it.
    Ready,
    /// Already enqueued on some other queue (entry/condition/acceptor/
    /// event) by the primitive that blocked it; the processor does nothing.
    Blocked,
    /// `main` returned or panicked.
    Halt,
    /// `migrate` moved the task to another cluster before suspending; its
    /// scheduling record now belongs there.
    Migrated,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

pub struct Task {
    id: TaskId,
    attr: TaskAttr,
    coroutine: Arc<Coroutine>,
    curr_cluster: Spinlock<Arc<Cluster>>,
    active_priority: AtomicI32,
    /// Ceilings of every priority-ceiling mutex currently held, for
    /// recomputing `active_priority` on release (§4.3).
    held_ceilings: Spinlock<Vec<Priority>>,
    accepted_call: Spinlock<Option<u32>>,
    post_resume: Spinlock<PostResumeStatus>,
    activated: std::sync::atomic::AtomicBool,
    /// Set by a processor's preemption timer (§4.2 "Preemption"); checked
    /// and cleared at this task's own safe points since a hosted OS thread
    /// cannot be context-switched out from underneath arbitrary user code
    /// the way the teacher's signal handler forces a yield mid-instruction.
    preempt_pending: std::sync::atomic::AtomicBool,
    /// Asynchronous-exception mailbox (§4.6 `ResumeAt`/`ThrowAt`): other
    /// tasks append here; only this task's own poll points drain it.
    pub(crate) mailbox: Spinlock<std::collections::VecDeque<crate::exception::Message>>,
    /// The processor currently dispatching this task, if any — set by that
    /// processor's own kernel-loop thread around `coroutine().resume()`
    /// (`uThisProcessor()`, completing the `uThisTask`/`uThisCoroutine`/
    /// `uThisCluster`/`uThisProcessor` quartet).
    current_processor: Spinlock<Option<Weak<Processor>>>,
}

impl Task {
    pub fn new(
        attr: TaskAttr,
        cluster: Arc<Cluster>,
        main: impl FnOnce() + Send + 'static,
    ) -> Arc<Task> {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|weak: &Weak<Task>| {
            let weak_for_body = weak.clone();
            let stack_size = attr.stack_size;
            let name = attr.name.clone();
            let coroutine = Arc::new(Coroutine::new(name, stack_size, false, move || {
                let task = weak_for_body
                    .upgrade()
                    .expect("task dropped before its coroutine started running");
                CURRENT_TASK.with(|c| *c.borrow_mut() = Some(Arc::clone(&task)));
                main();
                CURRENT_TASK.with(|c| *c.borrow_mut() = None);
            }));
            Task {
                id,
                active_priority: AtomicI32::new(attr.priority),
                attr,
                coroutine,
                curr_cluster: Spinlock::new(cluster),
                held_ceilings: Spinlock::new(Vec::new()),
                accepted_call: Spinlock::new(None),
                post_resume: Spinlock::new(PostResumeStatus::Ready),
                activated: std::sync::atomic::AtomicBool::new(false),
                preempt_pending: std::sync::atomic::AtomicBool::new(false),
                mailbox: Spinlock::new(std::collections::VecDeque::new()),
                current_processor: Spinlock::new(None),
            }
        })
    }

    pub fn bound_processor(&self) -> Option<ProcessorId> {
        self.attr.bound_processor
    }

    /// The processor currently running this task, if any.
    pub fn current_processor(&self) -> Option<Arc<Processor>> {
        self.current_processor.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_current_processor(&self, processor: Option<Weak<Processor>>) {
        *self.current_processor.lock() = processor;
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.coroutine.name()
    }

    pub fn coroutine(&self) -> &Arc<Coroutine> {
        &self.coroutine
    }

    pub fn base_priority(&self) -> Priority {
        self.attr.priority
    }

    pub fn active_priority(&self) -> Priority {
        self.active_priority.load(Ordering::Acquire)
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        Arc::clone(&self.curr_cluster.lock())
    }

    pub fn is_halted(&self) -> bool {
        self.coroutine.is_halted()
    }

    pub fn post_resume_status(&self) -> PostResumeStatus {
        *self.post_resume.lock()
    }

    pub fn accepted_call(&self) -> Option<u32> {
        *self.accepted_call.lock()
    }

    pub fn set_accepted_call(&self, member: Option<u32>) {
        *self.accepted_call.lock() = member;
    }

    /// Register with `cluster` and place the task on its ready queue.
    /// Tasks begin Ready but are not registered with any cluster's
    /// scheduler until this runs (§3: "Lifecycle: created by a
    /// creator-task... begins Ready").
    pub fn activate(self: &Arc<Task>) -> Result<(), ActivateTaskError> {
        if self.activated.swap(true, Ordering::AcqRel) {
            return Err(ActivateTaskError::BadContext);
        }
        let cluster = self.cluster();
        cluster.register_task(Arc::clone(self));
        cluster.make_ready(Arc::clone(self));
        Ok(())
    }

    pub fn set_priority(&self, priority: Priority) -> Result<(), SetTaskPriorityError> {
        if self.is_halted() {
            return Err(SetTaskPriorityError::BadObjectState);
        }
        // Base priority is fixed at construction in this crate (no
        // interior-mutable `attr`); only the active, possibly-boosted
        // priority can move, which is all the ceiling protocol needs.
        self.active_priority.store(priority, Ordering::Release);
        Ok(())
    }

    /// Boost `active_priority` to at least `ceiling` on acquiring a
    /// priority-ceiling mutex; record the ceiling so release can recompute.
    pub fn raise_for_mutex(&self, ceiling: Priority) {
        let mut ceilings = self.held_ceilings.lock();
        ceilings.push(ceiling);
        let top = ceilings.iter().copied().max().unwrap_or(self.attr.priority);
        self.active_priority.store(top.max(self.attr.priority), Ordering::Release);
    }

    /// Drop one held ceiling (the most recently acquired with this value)
    /// and recompute `active_priority` from what remains.
    pub fn lower_after_mutex(&self, ceiling: Priority) {
        let mut ceilings = self.held_ceilings.lock();
        if let Some(pos) = ceilings.iter().rposition(|&c| c == ceiling) {
            ceilings.remove(pos);
        }
        let top = ceilings.iter().copied().max().unwrap_or(self.attr.priority);
        self.active_priority.store(top.max(self.attr.priority), Ordering::Release);
    }

    /// Mark the task Ready and return control to whoever resumed it (the
    /// processor kernel loop). The processor re-enqueues it (§4.2 `yield`).
    pub fn yield_now(self: &Arc<Task>) {
        *self.post_resume.lock() = PostResumeStatus::Ready;
        Coroutine::suspend();
    }

    /// Mark the task Blocked and return control to the processor. Callers
    /// must have already enqueued `self` on whatever queue will make it
    /// Ready again (entry queue, condition queue, acceptor stack, event
    /// list) *before* calling this.
    pub fn mark_blocked_and_suspend(self: &Arc<Task>) {
        *self.post_resume.lock() = PostResumeStatus::Blocked;
        Coroutine::suspend();
    }

    /// Block the caller until `duration` has elapsed (§4.7 `uSleep`),
    /// riding the owning cluster's event list rather than a raw OS sleep so
    /// it composes with the rest of the scheduler (other tasks keep
    /// running on this task's processor while it waits).
    pub fn sleep(self: &Arc<Task>, duration: crate::time::Duration) {
        let cluster = self.cluster();
        let events = Arc::clone(cluster.event_list());
        let deadline = crate::time::Instant::now()
            .checked_add(duration)
            .unwrap_or_else(crate::time::Instant::now);
        let sleeper = Arc::clone(self);
        events.schedule_at(deadline, false, move || {
            sleeper.cluster().make_ready(Arc::clone(&sleeper));
        });
        self.mark_blocked_and_suspend();
    }

    /// Move to `dest`, updating both clusters' task-set bookkeeping, then
    /// yield so the next dispatch happens on a processor of `dest`
    /// (§4.3 `migrate`). A same-cluster migrate is a no-op.
    pub fn migrate(self: &Arc<Task>, dest: Arc<Cluster>) {
        {
            let mut cc = self.curr_cluster.lock();
            if Arc::ptr_eq(&cc, &dest) {
                return;
            }
            cc.unregister_task(self.id);
            *cc = Arc::clone(&dest);
        }
        dest.register_task(Arc::clone(self));
        dest.make_ready(Arc::clone(self));
        *self.post_resume.lock() = PostResumeStatus::Migrated;
        Coroutine::suspend();
    }

    /// The task running on this OS thread, if any.
    pub fn current() -> Option<Arc<Task>> {
        CURRENT_TASK.with(|c| c.borrow().clone())
    }

    pub(crate) fn request_preempt(&self) {
        self.preempt_pending.store(true, Ordering::Release);
    }

    /// Checked at runtime safe points (condition wait, monitor entry,
    /// `uSleep`, ...). If a preemption is pending and the task is not
    /// inside a non-preemptible spinlock-held region, yields once.
    pub fn poll_preemption(self: &Arc<Task>) {
        if self.preempt_pending.swap(false, Ordering::AcqRel) {
            if crate::sync::spinlock::any_spinlock_held() {
                self.preempt_pending.store(true, Ordering::Release);
                return;
            }
            self.yield_now();
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Task {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, FifoPolicy};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn activate_and_run_to_halt() {
        let cluster = Cluster::new("c", Box::new(FifoPolicy::new()));
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            log2.lock().unwrap().push(1);
        });
        task.activate().unwrap();
        let got = cluster.get_ready_task(1).expect("task should be ready");
        got.coroutine().resume();
        assert_eq!(got.post_resume_status(), PostResumeStatus::Halt);
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn double_activate_rejected() {
        let cluster = Cluster::new("c2", Box::new(FifoPolicy::new()));
        let task = Task::new(TaskAttr::default(), cluster, || {});
        task.activate().unwrap();
        assert_eq!(task.activate(), Err(ActivateTaskError::BadContext));
    }

    #[test]
    fn priority_ceiling_boosts_and_restores() {
        let cluster = Cluster::new("c3", Box::new(FifoPolicy::new()));
        let mut attr = TaskAttr::default();
        attr.priority = 5;
        let task = Task::new(attr, cluster, || {});
        assert_eq!(task.active_priority(), 5);
        task.raise_for_mutex(10);
        assert_eq!(task.active_priority(), 10);
        task.lower_after_mutex(10);
        assert_eq!(task.active_priority(), 5);
    }
}
