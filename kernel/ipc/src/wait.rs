//! Blocking outside of a message transfer: on a kernel wait list such as a
//! semaphore's, and for the answer of a closure posted to another CPU.

use crate::{block, receiver, IpcOutcome};
use abi::{commit_error, L4Error, L4Timeout, TimeoutPair};
use alloc::sync::Arc;
use context::{Context, ContextRef, IpcPhase, IpcWait, ThreadState};
use cpu::CpuId;
use queue::{Queue, QueueGuard, QueueStatus};
use scheduler::CpuSched;

/// Blocks the current context on `queue`, by priority, for at most `timeout`.
///
/// `waiters` is the caller's lock on `queue`; it is released once the
/// context is queued, so that a check the caller made under it (e.g., a
/// semaphore count) and the enqueue are atomic.
///
/// The caller commits the success tag to the frame beforehand. Whoever takes
/// the context off `queue` (with [`QueueStatus::Ok`]) and makes it ready
/// completes the wait; a timeout or a cancel overwrites the tag with
/// [`RTimeout`](L4Error::RTimeout) or [`RCanceled`](L4Error::RCanceled).
pub fn wait_on_queue(
    cs: &mut CpuSched,
    queue: &Arc<Queue<Context>>,
    mut waiters: QueueGuard<'_, Context>,
    timeout: L4Timeout,
) -> IpcOutcome {
    let me = cs.current().clone();
    assert!(
        !me.state().intersects(ThreadState::IPC_MASK),
        "wait_on_queue(): {:?} is already in an IPC operation", me
    );

    // a closed wait on ourselves, so that no sender matches
    me.set_partner(Some(&me));
    me.ipc().wait = IpcWait {
        phase: IpcPhase::QueueWait,
        timeout: TimeoutPair::new(timeout, L4Timeout::NEVER),
        wait_queue: Some(queue.clone()),
        ..IpcWait::default()
    };
    me.state_change_dirty(ThreadState::READY, ThreadState::RECEIVE_WAIT);
    waiters.enqueue_prio(me.clone(), me.sched().effective_prio());
    drop(waiters);
    debug!("{:?} waits on queue {:#x}", me, queue.id());

    receiver::setup_timer(cs, &me, timeout);
    if me.is_ready() {
        return queue_wait(cs, &me);
    }
    cs.schedule();
    IpcOutcome::Blocked
}

pub(crate) fn queue_wait(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    let state = me.state();
    let aborted = state.intersects(ThreadState::CANCEL | ThreadState::TIMEOUT);
    if !aborted && me.in_sender_list() {
        return block(cs, me, IpcPhase::QueueWait);
    }
    cs.reset_timeout(me);

    let queue = me.ipc().wait.wait_queue.take();
    // whoever took us off the list handed us what we waited for
    let dequeued = queue.map_or(false, |q| q.dequeue(me, QueueStatus::Invalid));
    if dequeued {
        let err = if state.contains(ThreadState::CANCEL) { L4Error::RCanceled } else { L4Error::RTimeout };
        let tag = me.frame().tag();
        let tag = commit_error(&mut me.utcb(), err, tag);
        me.frame().set_tag(tag);
        debug!("{:?}: wait ended with {:?}", me, err);
    }

    me.state_del_dirty(ThreadState::FULL_IPC_MASK);
    me.set_partner(None);
    me.set_ipc_phase(IpcPhase::Idle);
    IpcOutcome::Done
}

/// Runs `f` on `target` and blocks the current context until it has run.
///
/// `f` gets the target's scheduler and the waiting context, into whose frame
/// and UTCB it commits its result. If `target` is this CPU, `f` runs right away.
pub fn call_remote<F>(cs: &mut CpuSched, target: CpuId, f: F) -> IpcOutcome
where
    F: FnOnce(&mut CpuSched, &ContextRef) + Send + 'static,
{
    let me = cs.current().clone();
    if cs.machine().route(target) == cs.cpu() {
        f(cs, &me);
        return IpcOutcome::Done;
    }

    me.state_change_dirty(ThreadState::READY, ThreadState::DRQ_WAIT);
    me.set_ipc_phase(IpcPhase::RemoteCall);
    let waiter = me.clone();
    cs.remote_call(target, move |remote| {
        f(remote, &waiter);
        if remote.xcpu_state_change(&waiter, ThreadState::DRQ_WAIT, ThreadState::READY, false) {
            remote.request_resched();
        }
    });
    cs.schedule();
    IpcOutcome::Blocked
}

pub(crate) fn remote_call_wait(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    if me.state().contains(ThreadState::DRQ_WAIT) {
        return block(cs, me, IpcPhase::RemoteCall);
    }
    me.set_ipc_phase(IpcPhase::Idle);
    IpcOutcome::Done
}
