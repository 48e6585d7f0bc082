//! Accept selector: `acceptStart` and the acceptor table (§3 "Accept clause
//! table", §4.5).
//!
//! The entry-queue scan and the acceptor-list registration are two branches
//! of one operation, exactly as §4.5 describes them; grounded the same way
//! as [`crate::serial`] and [`crate::condition`] on `r3_kernel::wait`'s
//! habit of mutating a second collection without releasing the first lock.
//! The `_Else` clause is treated as the non-blocking variant: no immediate
//! match means an immediate [`AcceptError::NoApplicableClause`], never a
//! registration.

use std::sync::Arc;

use arrayvec::ArrayVec;
use either::Either;

use crate::error::AcceptError;
use crate::event::{EventHandle, EventList};
use crate::serial::{MemberId, Serial};
use crate::sync::spinlock::Spinlock;
use crate::task::Task;
use crate::time::Instant;

/// Accept clauses rarely exceed a handful of members in practice; a fixed
/// cap keeps the table off the heap the way a compiled clause table would
/// be in the teacher's translator-generated code.
pub const MAX_CLAUSES: usize = 16;

/// A task parked in `_Accept` with no immediately-matching caller, waiting
/// on the serial's acceptor list (§4.5 "enqueue on the acceptor list").
pub struct Acceptor {
    pub(crate) task: Arc<Task>,
    pub(crate) enabled: ArrayVec<MemberId, MAX_CLAUSES>,
    pub(crate) saved_recursion: u32,
    timeout: Spinlock<Option<(Arc<EventList>, EventHandle)>>,
}

impl Acceptor {
    /// Cancel this acceptor's timeout event, if one was armed — called by
    /// [`Serial::enter`] the instant a matching caller arrives, so the
    /// table and the timer are retired atomically (§4.5 ordering guarantee
    /// shared with accept-timeout races).
    pub(crate) fn cancel_timeout(&self) {
        if let Some((events, handle)) = self.timeout.lock().take() {
            events.cancel(handle);
        }
    }
}

fn classify_wake(task: &Arc<Task>) -> Either<MemberId, ()> {
    match task.accepted_call() {
        Some(member) => {
            task.set_accepted_call(None);
            Either::Left(member)
        }
        None => Either::Right(()),
    }
}

/// Compile an `_Accept`/`_Select` statement into one call: `table` lists the
/// currently-enabled member IDs (already filtered by their `_When` guards at
/// the call site); `timeout` is an absolute wake time for `_Timeout`;
/// `has_else` marks an `_Else` clause present. Returns the index into
/// `table` of the member that was served.
pub fn accept_start(
    serial: &Arc<Serial>,
    events: &Arc<EventList>,
    table: &[MemberId],
    timeout: Option<Instant>,
    has_else: bool,
) -> Result<usize, AcceptError> {
    let task = Task::current().ok_or(AcceptError::BadContext)?;

    let mut st = serial.state.lock();
    if st.disconnected {
        return Err(AcceptError::Disconnected);
    }

    // Immediate match: an entry-queue caller is already waiting for a
    // member this accept enables. It becomes owner and runs; we block in
    // its place, regaining ownership when it (eventually) exits (§4.5).
    if let Some(node) = st.entry_queue.remove_first(|n| table.contains(&n.member)) {
        let member = node.member;
        let idx = table.iter().position(|&m| m == member).expect("member came from `table`");
        task.set_accepted_call(Some(member));
        let saved_recursion = st.mutex_recursion;
        st.accept_signalled.push((Arc::clone(&task), saved_recursion));
        serial.install_owner(&mut st, node.task, 1);
        drop(st);
        task.mark_blocked_and_suspend();
        task.set_accepted_call(None);
        return Ok(idx);
    }

    if has_else {
        return Err(AcceptError::NoApplicableClause);
    }

    // No immediately-acceptable caller: give up ownership the same way
    // `exit()` would, register on the acceptor list, and arm a timeout if
    // requested. A later `enter()` matching our enabled set hands
    // ownership straight to itself and wakes us with `acceptedCall` set
    // (§4.5); the timer (if any) wakes us with it left empty.
    let mut enabled = ArrayVec::new();
    for &m in table.iter().take(MAX_CLAUSES) {
        let _ = enabled.try_push(m);
    }
    let saved_recursion = st.mutex_recursion;

    let old_owner = st.owner.take();
    if let Some(old) = &old_owner {
        serial.note_release(old);
    }
    if let Some((next, recursion)) = st.accept_signalled.pop() {
        serial.install_owner(&mut st, next, recursion);
    } else if let Some(node) = st.entry_queue.pop_front() {
        serial.install_owner(&mut st, node.task, 1);
    }

    let acceptor = Acceptor { task: Arc::clone(&task), enabled, saved_recursion, timeout: Spinlock::new(None) };

    if let Some(deadline) = timeout {
        let serial_for_timer = Arc::clone(serial);
        let task_for_timer = Arc::clone(&task);
        let handle = events.schedule_at(deadline, false, move || {
            fire_accept_timeout(&serial_for_timer, &task_for_timer);
        });
        *acceptor.timeout.lock() = Some((Arc::clone(events), handle));
    }

    st.acceptors.push(acceptor);
    drop(st);

    task.mark_blocked_and_suspend();

    let st = serial.state.lock();
    let became_owner = st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &task));
    if st.disconnected && !became_owner {
        return Err(AcceptError::Disconnected);
    }
    drop(st);

    match classify_wake(&task) {
        Either::Left(member) => {
            let idx = table.iter().position(|&m| m == member).expect("member came from `table`");
            Ok(idx)
        }
        Either::Right(()) => Err(AcceptError::Timeout),
    }
}

/// Timer callback for an armed `_Timeout`: if the acceptor is still
/// pending, pull it off the list and get it running again, respecting
/// mutual exclusion rather than forcing it Ready unconditionally.
fn fire_accept_timeout(serial: &Arc<Serial>, task: &Arc<Task>) {
    let mut st = serial.state.lock();
    let Some(pos) = st.acceptors.iter().position(|a| Arc::ptr_eq(&a.task, task)) else {
        return;
    };
    let found = st.acceptors.remove(pos);
    if st.owner.is_none() {
        serial.install_owner(&mut st, found.task, found.saved_recursion);
    } else {
        st.entry_queue.push_back(crate::serial::EntryNode { task: found.task, member: 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Cluster, FifoPolicy};
    use crate::processor::Processor;
    use crate::task::TaskAttr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn accept_matches_waiting_caller() {
        let cluster = Cluster::new("accept-test", Box::new(FifoPolicy::new()));
        let _p1 = Processor::spawn(Arc::clone(&cluster));
        let _p2 = Processor::spawn(Arc::clone(&cluster));
        let serial = Serial::new("s");
        let events = Arc::clone(cluster.event_list());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let (s1, e1, l1) = (Arc::clone(&serial), Arc::clone(&events), Arc::clone(&log));
        let acceptor_task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            s1.enter(0, false).unwrap();
            let idx = accept_start(&s1, &e1, &[7], None, false).unwrap();
            l1.lock().unwrap().push(("accepted", idx));
            s1.exit();
        });

        let (s2, l2) = (Arc::clone(&serial), Arc::clone(&log));
        let caller_task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            std::thread::sleep(Duration::from_millis(30));
            s2.enter(7, false).unwrap();
            l2.lock().unwrap().push(("called", 7));
            s2.exit();
        });

        acceptor_task.activate().unwrap();
        caller_task.activate().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let trace = log.lock().unwrap().clone();
        assert_eq!(trace, vec![("called", 7), ("accepted", 0)]);
    }

    #[test]
    fn accept_with_else_returns_immediately_without_match() {
        let cluster = Cluster::new("accept-else", Box::new(FifoPolicy::new()));
        let _p = Processor::spawn(Arc::clone(&cluster));
        let serial = Serial::new("s");
        let events = Arc::clone(cluster.event_list());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (s1, e1, l1) = (Arc::clone(&serial), Arc::clone(&events), Arc::clone(&log));
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            s1.enter(0, false).unwrap();
            let res = accept_start(&s1, &e1, &[7], None, true);
            l1.lock().unwrap().push(res.is_err());
            s1.exit();
        });
        task.activate().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }

    #[test]
    fn accept_times_out_when_nobody_calls() {
        let cluster = Cluster::new("accept-timeout", Box::new(FifoPolicy::new()));
        let _p = Processor::spawn(Arc::clone(&cluster));
        let serial = Serial::new("s");
        let events = Arc::clone(cluster.event_list());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (s1, e1, l1) = (Arc::clone(&serial), Arc::clone(&events), Arc::clone(&log));
        let task = Task::new(TaskAttr::default(), Arc::clone(&cluster), move || {
            s1.enter(0, false).unwrap();
            let deadline = crate::time::Instant::now()
                .checked_add(crate::time::Duration::from_millis(30))
                .unwrap();
            let res = accept_start(&s1, &e1, &[7], Some(deadline), false);
            l1.lock().unwrap().push(matches!(res, Err(AcceptError::Timeout)));
            s1.exit();
        });
        task.activate().unwrap();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(*log.lock().unwrap(), vec![true]);
    }
}
