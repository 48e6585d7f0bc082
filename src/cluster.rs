//! Cluster & ready queue (§3 "Cluster", §4.3).
//!
//! Grounded on `r3_kernel::task::readyqueue`'s pluggable-policy ready
//! queue: `add`/`pop`/`is_empty` behind a trait object so a FIFO or a
//! priority/ceiling policy can be swapped in without touching the
//! processor kernel loop.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use crate::collections::Fifo;
use crate::event::EventList;
use crate::processor::ProcessorId;
use crate::sync::spinlock::Spinlock;
use crate::task::{Priority, Task, TaskId};

/// A pluggable scheduling policy over a cluster's ready tasks (§4.3: "A
/// policy plug-in provides `empty`, `add`, `drop`, and optionally
/// `rescheduleTask`").
pub trait ReadyQueuePolicy: Send + Sync {
    fn add(&mut self, task: Arc<Task>);
    fn pop(&mut self) -> Option<Arc<Task>>;
    fn is_empty(&self) -> bool;
    /// Called whenever a task's active priority changes while it may be
    /// sitting in the queue; FIFO ignores this, priority queues re-sort.
    fn reschedule(&mut self, _task_id: TaskId) {}
}

/// Default policy: plain arrival order (§4.3 "The default policy is
/// FIFO").
#[derive(Default)]
pub struct FifoPolicy {
    queue: Fifo<Arc<Task>>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadyQueuePolicy for FifoPolicy {
    fn add(&mut self, task: Arc<Task>) {
        self.queue.push_back(task);
    }
    fn pop(&mut self) -> Option<Arc<Task>> {
        self.queue.pop_front()
    }
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct PrioritizedTask {
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for PrioritizedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.active_priority() == other.task.active_priority() && self.seq == other.seq
    }
}
impl Eq for PrioritizedTask {}
impl PartialOrd for PrioritizedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PrioritizedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; among equals, earliest-enqueued first
        // (min-seq), matching the FIFO tiebreak §4.3 references for
        // real-time policies built on explicit priorities.
        self.task
            .active_priority()
            .cmp(&other.task.active_priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A priority/ceiling-aware policy: dispatches the highest `active_priority`
/// task, breaking ties FIFO. The ceiling-priority *mutex protocol* itself
/// lives in `task::raise_for_mutex`/`lower_after_mutex`; this policy only
/// needs to read the (possibly boosted) priority back out (§4.3: "the
/// ceiling-priority policy additionally intercepts monitor entry to boost
/// the holder").
#[derive(Default)]
pub struct PriorityCeilingPolicy {
    heap: BinaryHeap<PrioritizedTask>,
    next_seq: u64,
}

impl PriorityCeilingPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadyQueuePolicy for PriorityCeilingPolicy {
    fn add(&mut self, task: Arc<Task>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(PrioritizedTask { seq, task });
    }
    fn pop(&mut self) -> Option<Arc<Task>> {
        self.heap.pop().map(|p| p.task)
    }
    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

struct State {
    tasks_on_cluster: Vec<Arc<Task>>,
    ready: Box<dyn ReadyQueuePolicy>,
    /// Per-processor private ready queues for bound tasks (§3 task data
    /// model, §4.3): a task with a `bound_processor` is only ever enqueued
    /// here, never on `ready`, so no other processor can dispatch it.
    bound_queues: HashMap<ProcessorId, VecDeque<Arc<Task>>>,
    idle_processors: VecDeque<Thread>,
}

/// A group of processors sharing one ready queue and one event list
/// (§3 "Cluster").
pub struct Cluster {
    name: String,
    state: Spinlock<State>,
    event_list: Arc<EventList>,
    id: u64,
}

static NEXT_CLUSTER_ID: AtomicU64 = AtomicU64::new(1);

impl Cluster {
    pub fn new(name: impl Into<String>, ready: Box<dyn ReadyQueuePolicy>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Spinlock::new(State {
                tasks_on_cluster: Vec::new(),
                ready,
                bound_queues: HashMap::new(),
                idle_processors: VecDeque::new(),
            }),
            event_list: EventList::new(),
            id: NEXT_CLUSTER_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_list(&self) -> &Arc<EventList> {
        &self.event_list
    }

    pub fn register_task(&self, task: Arc<Task>) {
        self.state.lock().tasks_on_cluster.push(task);
    }

    pub fn unregister_task(&self, id: TaskId) {
        self.state.lock().tasks_on_cluster.retain(|t| t.id() != id);
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().tasks_on_cluster.len()
    }

    /// Put `task` on the ready queue (or its bound processor's private
    /// queue, if it has one), waking one idle processor if any are parked
    /// (§3: "Idle processors are kept on an idle list to be woken on
    /// enqueue").
    pub fn make_ready(&self, task: Arc<Task>) {
        let mut st = self.state.lock();
        match task.bound_processor() {
            Some(pid) => st.bound_queues.entry(pid).or_default().push_back(task),
            None => st.ready.add(task),
        }
        if let Some(idle) = st.idle_processors.pop_front() {
            idle.unpark();
        }
    }

    /// Dispatch the next task for `processor`: its own bound queue first,
    /// falling back to the shared ready queue.
    pub fn get_ready_task(&self, processor: ProcessorId) -> Option<Arc<Task>> {
        let mut st = self.state.lock();
        if let Some(task) = st.bound_queues.get_mut(&processor).and_then(VecDeque::pop_front) {
            return Some(task);
        }
        st.ready.pop()
    }

    pub fn is_ready_empty(&self, processor: ProcessorId) -> bool {
        let st = self.state.lock();
        st.ready.is_empty() && st.bound_queues.get(&processor).map_or(true, |q| q.is_empty())
    }

    /// Register the calling processor's thread as idle. It will be
    /// unparked the next time a task becomes ready, or it can time out and
    /// re-check the queue itself (§4.2 idle routine).
    pub(crate) fn register_idle(&self, thread: Thread) {
        self.state.lock().idle_processors.push_back(thread);
    }

    pub(crate) fn remove_idle(&self, thread: &Thread) {
        self.state.lock().idle_processors.retain(|t| t.id() != thread.id());
    }
}
