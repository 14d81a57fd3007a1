//! The receiver side: accepting senders, pulling queued messages, sleeping in
//! the receive phase and committing the result.

use crate::{block, sender, wait_of, IpcOutcome};
use abi::{commit_error, L4Error, L4Timeout};
use context::{Context, ContextRef, HelpingMode, IpcPhase, ThreadState};
use queue::QueueStatus;
use scheduler::{CpuSched, Switch};

/// Whether `receiver` accepts a message from `sender` right now.
///
/// It must be waiting in its receive phase and nothing else. An open wait
/// takes `sender` if nobody is queued ahead of it; a closed wait only takes
/// its partner.
pub fn sender_ok(receiver: &Context, sender: &Context) -> bool {
    let state = receiver.state() & (ThreadState::IPC_MASK | ThreadState::IPC_TRANSFER);
    if state != ThreadState::RECEIVE_WAIT {
        return false;
    }
    match receiver.partner() {
        Some(partner) => context::same(&partner, sender),
        None => receiver
            .sender_list()
            .q_lock()
            .first()
            .map_or(true, |head| context::same(head, sender)),
    }
}

fn closed_sender(me: &Context) -> Option<ContextRef> {
    if me.ipc().wait.closed_wait {
        me.partner()
    } else {
        None
    }
}

/// Whether a sender the receive phase accepts is queued.
fn has_next_sender(me: &Context, closed: Option<&ContextRef>) -> bool {
    match closed {
        Some(sender) => me.sender_list().owns(sender),
        None => !me.sender_list().is_empty(),
    }
}

/// The queued sender the receive phase takes next. An open wait makes it the partner.
fn get_next_sender(me: &Context, closed: Option<&ContextRef>) -> Option<ContextRef> {
    match closed {
        Some(sender) if me.sender_list().owns(sender) => Some(sender.clone()),
        Some(_) => None,
        None => {
            let head = me.sender_list().q_lock().first().cloned()?;
            me.set_partner(Some(&head));
            Some(head)
        }
    }
}

/// Wakes the receiver of a completed send. Returns whether `me` stopped running.
///
/// With `do_switch`, the CPU goes straight to `partner`, which then runs on
/// the timeslice of `me`. That only happens on a call, or when `me` runs on a
/// timeslice that is not its own.
fn activate_ipc_partner(cs: &mut CpuSched, me: &ContextRef, partner: &ContextRef, do_switch: bool, closed_wait: bool) -> bool {
    if partner.home_cpu() != cs.cpu() {
        cs.xcpu_state_change(partner, ThreadState::IPC_TRANSFER, ThreadState::READY, false);
        return false;
    }

    let foreign = !ready_queue::same_opt(cs.rq().current_sched(), Some(me.sched()));
    let do_switch = do_switch && (closed_wait || foreign);
    partner.state_change_dirty(ThreadState::IPC_TRANSFER, ThreadState::READY);
    if do_switch {
        if cs.switch_exec_locked(partner, HelpingMode::Helping) != Switch::Ok {
            cs.schedule();
        }
    } else {
        cs.deblock_and_schedule(partner);
    }
    !context::same(cs.current(), me)
}

/// The receive phase, after the send phase (if any) delivered its message.
///
/// `activate` is the receiver of that message, still to be woken.
pub(crate) fn receive(cs: &mut CpuSched, me: &ContextRef, activate: Option<ContextRef>) -> IpcOutcome {
    let closed = closed_sender(me);

    if let Some(partner) = activate {
        let have_receive = me.state().contains(ThreadState::RECEIVE_WAIT);
        let pending = have_receive && has_next_sender(me, closed.as_ref());
        let do_switch = me.ipc().wait.do_switch && !pending;
        if activate_ipc_partner(cs, me, &partner, do_switch, have_receive && closed.is_some()) {
            if !me.state().intersects(ThreadState::FULL_IPC_MASK) {
                return finish(cs, me);
            }
            me.set_ipc_phase(IpcPhase::Receive);
            return IpcOutcome::Blocked;
        }
    }

    loop {
        if !me.state().contains(ThreadState::RECEIVE_WAIT) {
            return finish(cs, me);
        }
        let next = match get_next_sender(me, closed.as_ref()) {
            Some(next) => next,
            None => return goto_sleep(cs, me),
        };

        me.state_change_dirty(ThreadState::IPC_MASK, ThreadState::RECEIVE_IN_PROGRESS);
        match ipc_send_msg(cs, &next, me) {
            Some(preempt) => {
                me.state_del_dirty(ThreadState::IPC_MASK);
                let outcome = finish(cs, me);
                if preempt {
                    cs.schedule();
                }
                return outcome;
            }
            None => {
                // the sender gave up in the meantime
                me.state_change_dirty(ThreadState::RECEIVE_IN_PROGRESS, ThreadState::RECEIVE_WAIT);
                me.set_partner(closed.as_ref());
            }
        }
    }
}

/// Pulls the pending message of the queued `sender` into `receiver`.
///
/// The sender is woken, or moved on to its own receive phase. Returns `None`
/// if the sender left the list before we got it, otherwise whether the
/// sender should preempt.
fn ipc_send_msg(cs: &mut CpuSched, sender: &ContextRef, receiver: &Context) -> Option<bool> {
    if !receiver.sender_list().dequeue(sender, QueueStatus::Ok) {
        return None;
    }
    let wait = wait_of(sender);
    sender::transfer_msg(sender, receiver, wait.tag, wait.label, wait.send_rights);
    sender.frame().set_tag(wait.tag.without_flags(abi::TagFlags::ERROR));

    let next_phase = if wait.have_receive { ThreadState::RECEIVE_WAIT } else { ThreadState::empty() };
    sender.state_change_dirty(ThreadState::SEND_WAIT, next_phase);
    debug!("{:?} took the message of {:?}", receiver, sender);
    Some(cs.xcpu_state_change(sender, ThreadState::IPC_TRANSFER, ThreadState::READY, false))
}

/// Arms the IPC timeout of `ctx` for `timeout`.
///
/// Never does nothing. A zero timeout, or one that lies in the past, makes
/// `ctx` ready with `TIMEOUT` set right away.
pub fn setup_timer(cs: &mut CpuSched, ctx: &Context, timeout: L4Timeout) {
    if timeout.is_never() {
        return;
    }
    if timeout.is_zero() {
        ctx.state_add_dirty(ThreadState::READY | ThreadState::TIMEOUT);
        return;
    }
    let clock = cs.clock();
    let wakeup = timeout.microsecs(clock, &ctx.utcb());
    if wakeup > clock {
        cs.set_timeout(ctx, ctx.ipc_timeout(), wakeup);
    } else {
        ctx.state_add_dirty(ThreadState::READY | ThreadState::TIMEOUT);
    }
}

fn goto_sleep(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    if me.state() & ThreadState::FULL_IPC_MASK != ThreadState::RECEIVE_WAIT {
        return finish(cs, me);
    }
    me.state_del_dirty(ThreadState::READY);
    let rcv = me.ipc().wait.timeout.rcv;
    setup_timer(cs, me, rcv);
    if me.is_ready() {
        return finish(cs, me);
    }
    me.set_ipc_phase(IpcPhase::ReceiveWait);
    trace!("{:?} sleeps in its receive phase", me);
    cs.schedule();
    IpcOutcome::Blocked
}

pub(crate) fn receive_wait(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    if me.state() & ThreadState::FULL_IPC_MASK == ThreadState::RECEIVE_WAIT {
        // woken without a message, a timeout or a cancel
        return block(cs, me, IpcPhase::ReceiveWait);
    }
    finish(cs, me)
}

/// Commits the result of the operation and clears all IPC state.
pub(crate) fn finish(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    let state = me.state();
    if state.contains(ThreadState::IPC_TRANSFER) {
        return block(cs, me, IpcPhase::Finish);
    }

    if state.intersects(ThreadState::IPC_MASK) {
        let err = if state.contains(ThreadState::CANCEL) { L4Error::RCanceled } else { L4Error::RTimeout };
        let tag = me.frame().tag();
        let tag = commit_error(&mut me.utcb(), err, tag);
        me.frame().set_tag(tag);
        debug!("{:?}: receive phase ended with {:?}", me, err);

        // a call that got no answer revokes the reply capability it handed out
        let wait = wait_of(me);
        if let Some(partner) = wait.send_partner().filter(|_| wait.closed_wait) {
            if me.is_partner(&partner) && partner.is_caller(me) {
                partner.reset_caller();
            }
        }
    }

    if state.intersects(ThreadState::FULL_IPC_MASK) {
        me.state_del_dirty(ThreadState::FULL_IPC_MASK);
    }
    cs.reset_timeout(me);
    me.set_ipc_phase(IpcPhase::Idle);
    IpcOutcome::Done
}

/// Fails every sender queued on `receiver`, e.g., because it is being destroyed.
///
/// The senders see [`NotExistent`](L4Error::NotExistent). Returns how many there were.
pub fn ipc_receiver_aborted(cs: &mut CpuSched, receiver: &Context) -> usize {
    let senders = receiver.sender_list().q_lock().drain(QueueStatus::Invalid);
    let count = senders.len();
    for sender in senders {
        debug!("{:?} goes away, failing sender {:?}", receiver, sender);
        if cs.xcpu_state_change(&sender, ThreadState::empty(), ThreadState::TRANSFER_FAILED | ThreadState::READY, false) {
            cs.request_resched();
        }
    }
    count
}
