//! μC++: a user-level concurrency kernel — tasks, coroutines, monitors
//! (serials), an accept selector, inter-task exceptions, a per-cluster
//! event/timer subsystem, and a per-task heap, all atop ordinary OS threads.
//!
//! This crate implements the *runtime* a source-to-source translator would
//! target when lowering `_Task`/`_Mutex`/`_Accept`/`_Select`/`_Throw`/
//! `_Resume`/`_Enable`/`COBEGIN` block syntax; that translator itself, I/O
//! polling, and the concrete real-time scheduling policies are out of scope
//! (spec.md §1 Non-goals). Callers construct [`task::Task`], [`serial::Serial`],
//! and friends directly — the same calls generated code would emit.

pub mod abort;
pub mod accept;
pub mod cluster;
pub mod cobegin;
pub mod collections;
pub mod condition;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod event;
pub mod exception;
pub mod heap;
pub mod processor;
pub mod serial;
pub mod sync;
pub mod task;
pub mod time;

pub use cluster::Cluster;
pub use coroutine::Coroutine;
pub use processor::Processor;
pub use serial::Serial;
pub use task::Task;

/// The task running on the calling OS thread, if any (`uThisTask()`).
pub fn this_task() -> Option<std::sync::Arc<Task>> {
    Task::current()
}

/// The coroutine running on the calling OS thread, if any (`uThisCoroutine()`).
pub fn this_coroutine() -> Option<std::sync::Arc<Coroutine>> {
    Coroutine::current()
}

/// The cluster the currently-running task belongs to (`uThisCluster()`).
pub fn this_cluster() -> Option<std::sync::Arc<Cluster>> {
    this_task().map(|t| t.cluster())
}

/// The processor currently running the calling task, if any (`uThisProcessor()`).
pub fn this_processor() -> Option<std::sync::Arc<Processor>> {
    this_task().and_then(|t| t.current_processor())
}

/// Terminate the process after flushing logs, as every kernel-detected
/// programming error does (§7 "Failure modes": "these are aborts, not
/// exceptions"). Prefer [`abort::abort`]/[`crate::uc_abort`] from within the
/// crate; this is the public equivalent for callers embedding the runtime.
pub fn abort(msg: std::fmt::Arguments<'_>) -> ! {
    abort::abort(&msg)
}
