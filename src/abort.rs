//! Runtime-assertion failure path (§4.2 "Failure model", §7).
//!
//! A programming error (double-acquire by a different task, free of an
//! unknown block, `wait` without owning the monitor, ...) calls [`abort`].
//! `abort` must be reentrancy-safe across processors: several OS threads
//! can hit a broken invariant within the same instant. Grounded on
//! `r3_port_std::ums`'s shutdown path, which takes a single lock and parks
//! every caller but the winner so only one thread ever runs teardown/exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static ABORTING: AtomicBool = AtomicBool::new(false);
static ABORT_ONCE: Once = Once::new();

/// Abort the process after a runtime assertion fails.
///
/// The first caller prints `msg` to stderr (and logs it at `error` level)
/// and exits the process. Every subsequent caller — from any processor
/// thread — parks forever instead of racing the winner through teardown.
pub fn abort(msg: &std::fmt::Arguments<'_>) -> ! {
    if ABORTING.swap(true, Ordering::AcqRel) {
        loop {
            std::thread::park();
        }
    }
    ABORT_ONCE.call_once(|| {
        log::error!("uC++ runtime abort: {msg}");
        eprintln!("uC++ runtime abort: {msg}");
        std::process::exit(101);
    });
    unreachable!("Once guarantees call_once's closure runs exactly once and it never returns")
}

/// Convenience wrapper mirroring the embedding API's `abort(fmt, ...)`
/// (§6): formats its arguments the way `format!` does.
#[macro_export]
macro_rules! uc_abort {
    ($($arg:tt)*) => {
        $crate::abort::abort(&format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    // `abort` terminates the process, so it cannot be exercised directly
    // from this in-process test harness; see
    // `tests/abort_on_programming_error.rs`, which re-execs the test
    // binary as a child and asserts on its exit code instead.
}
