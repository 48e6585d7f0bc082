//! Error families returned by the kernel's public operations.
//!
//! Programming errors (double-acquire, wait-without-owning, ...) never show up
//! here — those call [`crate::abort::abort`]. These enums are for the soft,
//! expected failure modes: bad context, timeout, a serial drained out from
//! under a waiter, and so on.

use core::fmt;

macro_rules! error_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.write_str(stringify!($variant))),+
                }
            }
        }

        impl std::error::Error for $name {}
    };
}

error_enum! {
    /// The calling context does not permit this operation (e.g. called from
    /// a processor's scheduling loop rather than from a task).
    pub enum BadContextError { BadContext }
}

error_enum! {
    /// Entering or locking failed because the wait completed with a timeout.
    pub enum WaitTimeoutError { Interrupted, Timeout }
}

error_enum! {
    pub enum ActivateTaskError { BadContext, QueueOverflow }
}

error_enum! {
    pub enum SetTaskPriorityError { BadContext, BadObjectState, BadParam }
}

error_enum! {
    /// Returned by a `Serial`'s blocking entry/wait/accept operations when the
    /// serial is torn down while the caller is still queued.
    pub enum RendezvousError { BadContext, Timeout, Disconnected }
}

error_enum! {
    /// `_Accept`/`_Select` failure: no clause's guard was true and there was
    /// no `_Else`.
    pub enum AcceptError { BadContext, NoApplicableClause, Timeout, Disconnected }
}

error_enum! {
    pub enum SleepError { Interrupted }
}

/// Convert a timeout-flavoured wait result into its non-timeout counterpart.
///
/// Panics if given `Timeout` — callers use this only on wait paths that never
/// pass a deadline, so a `Timeout` here indicates a kernel bug.
pub(crate) fn expect_not_timeout(e: WaitTimeoutError) -> RendezvousError {
    match e {
        WaitTimeoutError::Interrupted => RendezvousError::Disconnected,
        WaitTimeoutError::Timeout => unreachable!("got Timeout on a non-timed wait"),
    }
}
