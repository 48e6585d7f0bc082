//! Test-and-set spinlock — the "Spinlock & atomic primitives" component
//! (spec.md §2) every other internal lock is built on.
//!
//! This plays the role of `r3_kernel::klock`'s `CpuLockCell`/`CpuLockGuard`
//! (a token you must hold before touching protected state), re-expressed as
//! a real multi-writer spinlock: the teacher's single-core kernel disables
//! interrupts instead of spinning because there is only ever one core
//! contending; a hosted runtime backed by several OS-thread processors has
//! genuine parallel writers, so we compare-and-swap an `AtomicBool`.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    /// A task holding a spinlock must not be preempted mid-hold (spec.md §5,
    /// "a task holding a spinlock is non-preemptible"). Tracked per OS
    /// thread rather than process-wide: in this runtime each task owns one
    /// dedicated OS thread for its whole lifetime (see `crate::coroutine`),
    /// so a thread-local count is equivalently a per-task count, and one
    /// task's held locks can never defer another task's preemption.
    /// `task::poll_preemption` refuses to preempt while its own thread's
    /// count is nonzero.
    static SPIN_HOLD_DEPTH: Cell<u32> = const { Cell::new(0) };
}

fn spin_hold_inc() {
    SPIN_HOLD_DEPTH.with(|d| d.set(d.get() + 1));
}

fn spin_hold_dec() {
    SPIN_HOLD_DEPTH.with(|d| d.set(d.get() - 1));
}

pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut backoff = 1u32;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }
        spin_hold_inc();
        SpinGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            spin_hold_inc();
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// # Safety
    /// The caller must already hold the lock (directly or via an assumed
    /// critical section) and guarantee no other reference to the contents
    /// is live.
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> core::ops::Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        spin_hold_dec();
    }
}

/// True if the calling OS thread currently holds any spinlock. Checked by
/// the runtime's assertions (spec.md §5: "No implicit suspension inside a
/// spinlock-held region").
pub fn any_spinlock_held() -> bool {
    SPIN_HOLD_DEPTH.with(|d| d.get() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_under_contention() {
        let counter = Arc::new(Spinlock::new(0u64));
        let mut handles = vec![];
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 80_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new(5);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
