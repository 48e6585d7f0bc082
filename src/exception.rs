//! Exception manager (§3 "Exception manager", §4.6).
//!
//! Termination is the host's own unwinder: [`throw`] is `panic_any`, and
//! [`crate::coroutine::Coroutine`]'s worker thread already wraps `main` in
//! `catch_unwind` (§4.6 "propagation out of `main`... marks the coroutine
//! Halt"). Resumption is the half the host language doesn't have: a
//! thread-local handler stack walked innermost-to-outermost, since a
//! resumption handler is "logical", not a unwind-integrated stack frame.
//! Grounded on `r3_kernel`'s habit of keeping per-executor dynamic state
//! (current interrupt mask, current task) in thread-locals rather than
//! passing it explicitly through every call — the same shape fits a
//! per-OS-thread-per-task resumption-handler stack here.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::task::Task;

/// One entry of the resumption-handler stack (§4.6: "for each handler whose
/// declared exception type matches... skip it if already marked in-use").
struct Handler {
    type_id: TypeId,
    bound_object: Option<usize>,
    in_use: AtomicBool,
    run: Box<dyn Fn(&dyn Any) + Send>,
}

thread_local! {
    static HANDLERS: RefCell<Vec<Handler>> = const { RefCell::new(Vec::new()) };
    /// Enabled-type stack (§4.6 `_Enable { … } _Disable { … }`); empty means
    /// "all disabled", the default at task start.
    static ENABLED: RefCell<Vec<HashSet<TypeId>>> = const { RefCell::new(Vec::new()) };
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RaiseKind {
    Resume,
    Throw,
}

pub(crate) struct Message {
    /// Boxed (not `Arc`-wrapped) so [`deliver_throw`] can unwind with this
    /// exact box and the unwind payload stays `Box<E>`, matching what
    /// [`throw`]'s `panic_any(e)` produces for the synchronous path.
    payload: Box<dyn Any + Send>,
    type_id: TypeId,
    kind: RaiseKind,
}

/// Register a resumption handler for `E` for the dynamic extent of `body`,
/// then run `body`. Mirrors the source-to-source translator's lowering of a
/// `_CatchResume` block to a push/pop pair around the guarded statement.
pub fn catch_resume<E, R>(handler: impl Fn(&E) + Send + 'static, body: impl FnOnce() -> R) -> R
where
    E: Any + 'static,
{
    catch_resume_bound(None, handler, body)
}

/// As [`catch_resume`], but only matches a `resume_at`/`throw_at` whose
/// `bound_object` equals `bound` (§4.6: "whose optional bound-object pointer
/// equals `e.boundObject`") — used when several instances of the same
/// exception type are in flight and only one instance's raiser should match.
pub fn catch_resume_bound<E, R>(bound: Option<usize>, handler: impl Fn(&E) + Send + 'static, body: impl FnOnce() -> R) -> R
where
    E: Any + 'static,
{
    let entry = Handler {
        type_id: TypeId::of::<E>(),
        bound_object: bound,
        in_use: AtomicBool::new(false),
        run: Box::new(move |payload: &dyn Any| {
            if let Some(e) = payload.downcast_ref::<E>() {
                handler(e);
            }
        }),
    };
    HANDLERS.with(|h| h.borrow_mut().push(entry));
    let result = body();
    HANDLERS.with(|h| {
        h.borrow_mut().pop();
    });
    result
}

/// Raise `e` as a resumption on the current coroutine (§4.6 `Resume`):
/// walk the handler stack innermost-to-outermost for a non-recursive,
/// type-and-binding-matching handler. Falls back to [`throw`] if none
/// matches — resumption with no handler terminates exactly like a throw.
pub fn resume<E: Any + Send + Sync + 'static>(e: E) {
    let handled = HANDLERS.with(|stack| {
        let stack = stack.borrow();
        for h in stack.iter().rev() {
            if h.type_id != TypeId::of::<E>() {
                continue;
            }
            if h.bound_object.is_some() && h.bound_object != Some(&e as *const E as usize) {
                continue;
            }
            if h.in_use.swap(true, Ordering::AcqRel) {
                continue;
            }
            (h.run)(&e);
            h.in_use.store(false, Ordering::Release);
            return true;
        }
        false
    });
    if !handled {
        throw(e);
    }
}

/// Raise `e` as a termination exception (§4.6 `Throw`): host-unwinder
/// propagation, caught by [`crate::coroutine::Coroutine`]'s worker thread.
pub fn throw<E: Any + Send + 'static>(e: E) -> ! {
    std::panic::panic_any(e)
}

/// Append an asynchronous resumption for `target` (§4.6 `ResumeAt`). The
/// target only observes it at its own poll points, not immediately.
pub fn resume_at<E: Any + Send + Sync + 'static>(target: &Arc<Task>, e: E) {
    push_message(target, e, RaiseKind::Resume);
}

/// Append an asynchronous termination for `target` (§4.6 `ThrowAt`).
pub fn throw_at<E: Any + Send + Sync + 'static>(target: &Arc<Task>, e: E) {
    push_message(target, e, RaiseKind::Throw);
}

fn push_message<E: Any + Send + Sync + 'static>(target: &Arc<Task>, e: E, kind: RaiseKind) {
    let msg = Message { payload: Box::new(e), type_id: TypeId::of::<E>(), kind };
    target.mailbox.lock().push_back(msg);
}

/// Push a new enabled-type set for the dynamic extent of `body`
/// (§4.6 `_Enable { types… } { body }`).
pub fn enable<R>(types: &[TypeId], body: impl FnOnce() -> R) -> R {
    ENABLED.with(|e| e.borrow_mut().push(types.iter().copied().collect()));
    let result = body();
    ENABLED.with(|e| {
        e.borrow_mut().pop();
    });
    result
}

/// A runtime poll point (§4.6 "on entering/leaving certain runtime
/// primitives, at explicit `_Poll` calls, and at scheduled yields"): if
/// delivery is enabled and the mailbox has a deliverable message, pop the
/// oldest one and deliver it as a resume or a throw.
///
/// Per-sender FIFO order (§4.6 "messages from a single sender to a single
/// target are delivered in send order") is a corollary of draining one
/// mailbox strictly oldest-first; nothing here reorders across senders,
/// which the spec explicitly leaves unguaranteed.
pub fn poll() {
    let Some(task) = Task::current() else { return };
    let enabled_now = ENABLED.with(|e| e.borrow().last().cloned());
    let Some(enabled_now) = enabled_now else { return };
    if enabled_now.is_empty() {
        return;
    }
    let deliverable = {
        let mut mailbox = task.mailbox.lock();
        let pos = mailbox.iter().position(|m| enabled_now.contains(&m.type_id));
        pos.and_then(|i| mailbox.remove(i))
    };
    let Some(msg) = deliverable else { return };
    deliver(msg);
}

fn deliver(msg: Message) {
    match msg.kind {
        RaiseKind::Resume => deliver_resume(msg),
        RaiseKind::Throw => deliver_throw(msg),
    }
}

fn deliver_resume(msg: Message) {
    HANDLERS.with(|stack| {
        let stack = stack.borrow();
        for h in stack.iter().rev() {
            if h.type_id != msg.type_id {
                continue;
            }
            if h.in_use.swap(true, Ordering::AcqRel) {
                continue;
            }
            (h.run)(msg.payload.as_ref());
            h.in_use.store(false, Ordering::Release);
            return;
        }
    });
}

fn deliver_throw(msg: Message) -> ! {
    std::panic::resume_unwind(msg.payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, FifoPolicy};
    use crate::task::TaskAttr;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct Ping(u32);

    #[test]
    fn resume_dispatches_to_innermost_matching_handler() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let l = Arc::clone(&log);
        catch_resume::<Ping, _>(
            move |p: &Ping| l.lock().unwrap().push(p.0),
            || {
                resume(Ping(7));
            },
        );
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[test]
    fn async_resume_delivered_only_when_enabled() {
        let cluster = Cluster::new("exc-test", Box::new(FifoPolicy::new()));
        let log = Arc::new(StdMutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            poll();
            assert!(l1.lock().unwrap().is_empty());
            enable(&[TypeId::of::<Ping>()], || {
                catch_resume::<Ping, _>(
                    {
                        let l2 = Arc::clone(&l1);
                        move |p: &Ping| l2.lock().unwrap().push(p.0)
                    },
                    || {
                        poll();
                    },
                );
            });
        });
        resume_at(&task, Ping(9));
        task.coroutine().resume();
        assert_eq!(*log.lock().unwrap(), vec![9]);
    }
}
