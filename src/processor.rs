//! Processor kernel: a per-virtual-processor scheduling loop on its own
//! OS thread (§3 "Processor", §4.2).
//!
//! The loop itself — ask the ready queue, dispatch, inspect what happened
//! — follows §4.2 directly. The preemption signal is grounded on
//! `r3_port_std::threading_unix`'s use of `libc::sigaction`/`pthread_kill`
//! for cross-thread signalling, repurposed from that module's "remote
//! park" use case to this crate's periodic preemption tick. Where the
//! teacher's port signals a thread that is genuinely suspended mid-
//! instruction, a hosted user task here only ever yields at its own safe
//! points (§4.2 "forces a yield at the next safe point"); see
//! [`crate::task::Task::poll_preemption`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU32, Ordering};
use std::sync::Arc;
#[cfg(unix)]
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use crate::cluster::Cluster;
use crate::task::{PostResumeStatus, Task};

pub type ProcessorId = u64;

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

#[cfg(unix)]
static INSTALL_PREEMPT_HANDLER: Once = Once::new();

#[cfg(unix)]
extern "C" fn preempt_signal_handler(_sig: libc::c_int) {
    // Intentionally empty: the signal's only job is to exist so
    // `pthread_kill` parity with the teacher's interrupt mechanism
    // doesn't kill the process. The actual yield decision is made by the
    // victim task at its next safe point (see module docs).
}

#[cfg(unix)]
fn ensure_preempt_handler_installed() {
    INSTALL_PREEMPT_HANDLER.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = preempt_signal_handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
    });
}

struct SharedState {
    current_task: crate::sync::spinlock::Spinlock<Option<Arc<Task>>>,
}

/// A kernel-thread-backed driver for one virtual processor.
pub struct Processor {
    id: ProcessorId,
    cluster: Arc<Cluster>,
    state: SharedState,
    /// Explicit preempt-disable counter (§3 `disableInt`): runtime
    /// critical sections that must not be preempted bump this.
    disable_int: AtomicU32,
    shutdown: AtomicBool,
    #[cfg(unix)]
    native_thread: crate::sync::spinlock::Spinlock<Option<libc::pthread_t>>,
    kernel_handle: crate::sync::spinlock::Spinlock<Option<JoinHandle<()>>>,
    preempt_handle: crate::sync::spinlock::Spinlock<Option<JoinHandle<()>>>,
}

impl Processor {
    /// Spawn a processor's kernel loop (and its preemption timer) driving
    /// `cluster`.
    pub fn spawn(cluster: Arc<Cluster>) -> Arc<Processor> {
        #[cfg(unix)]
        ensure_preempt_handler_installed();

        let this = Arc::new(Processor {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            cluster,
            state: SharedState { current_task: crate::sync::spinlock::Spinlock::new(None) },
            disable_int: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            #[cfg(unix)]
            native_thread: crate::sync::spinlock::Spinlock::new(None),
            kernel_handle: crate::sync::spinlock::Spinlock::new(None),
            preempt_handle: crate::sync::spinlock::Spinlock::new(None),
        });

        let kernel_this = Arc::clone(&this);
        let kernel_handle = thread::Builder::new()
            .name(format!("uc-processor-{}", this.id))
            .spawn(move || kernel_this.run_loop())
            .expect("failed to spawn processor kernel thread");
        *this.kernel_handle.lock() = Some(kernel_handle);

        let preempt_this = Arc::clone(&this);
        let preempt_handle = thread::Builder::new()
            .name(format!("uc-processor-{}-preempt", this.id))
            .spawn(move || preempt_this.preemption_loop())
            .expect("failed to spawn preemption timer thread");
        *this.preempt_handle.lock() = Some(preempt_handle);

        this
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.state.current_task.lock().clone()
    }

    pub fn disable_preemption(&self) {
        self.disable_int.fetch_add(1, Ordering::AcqRel);
    }

    pub fn enable_preemption(&self) {
        self.disable_int.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn run_loop(self: Arc<Self>) {
        #[cfg(unix)]
        {
            *self.native_thread.lock() = Some(unsafe { libc::pthread_self() });
        }
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.cluster.get_ready_task(self.id) {
                Some(task) => {
                    *self.state.current_task.lock() = Some(Arc::clone(&task));
                    task.set_current_processor(Some(Arc::downgrade(&self)));
                    task.coroutine().resume();
                    task.set_current_processor(None);
                    *self.state.current_task.lock() = None;
                    match task.post_resume_status() {
                        PostResumeStatus::Ready => self.cluster.make_ready(task),
                        PostResumeStatus::Blocked | PostResumeStatus::Migrated => {}
                        PostResumeStatus::Halt => self.cluster.unregister_task(task.id()),
                    }
                }
                None => self.idle(),
            }
        }
    }

    /// §4.2 idle routine: spin up to `spinCount` checks, then park on a
    /// per-processor registration in the cluster's idle list.
    fn idle(&self) {
        let spin_count = crate::config::config().default_spin;
        for _ in 0..spin_count {
            if !self.cluster.is_ready_empty(self.id) {
                return;
            }
            std::hint::spin_loop();
        }
        let me = thread::current();
        self.cluster.register_idle(me.clone());
        if self.cluster.is_ready_empty(self.id) && !self.shutdown.load(Ordering::Acquire) {
            thread::park_timeout(StdDuration::from_millis(50));
        }
        self.cluster.remove_idle(&me);
    }

    fn preemption_loop(self: Arc<Self>) {
        let interval = crate::config::config().default_preemption;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            thread::sleep(interval.as_std());
            if self.disable_int.load(Ordering::Acquire) != 0 {
                continue;
            }
            // `any_spinlock_held()` is per-OS-thread; this timer thread
            // never itself holds a spinlock, so the authoritative check
            // happens on the victim's own thread in
            // `task::Task::poll_preemption` instead.
            if let Some(task) = self.state.current_task.lock().clone() {
                task.request_preempt();
                #[cfg(unix)]
                if let Some(native) = *self.native_thread.lock() {
                    unsafe {
                        libc::pthread_kill(native, libc::SIGUSR1);
                    }
                }
            }
        }
    }
}

impl Drop for Processor {
    /// Best-effort: request both background threads stop. This never
    /// blocks on `join` — the kernel-loop thread holds its own `Arc<Self>`
    /// clone for the duration of `run_loop`, so `Processor`'s refcount
    /// only reaches zero from inside that thread's own unwind once it has
    /// already observed `shutdown`; joining here would be a self-join.
    /// Callers that need a hard join should keep the `JoinHandle`s
    /// themselves before dropping the last `Arc<Processor>`.
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
