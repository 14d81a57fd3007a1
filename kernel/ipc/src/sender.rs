//! The sender side: offering a message, waiting in a receiver's sender list
//! and giving up on a send.

use crate::{block, receiver, wait_of, IpcOutcome};
use abi::{L4Error, MsgTag, Mword, Rights, TagFlags, Utcb};
use context::{CheckSender, Context, ContextRef, IpcPhase, ThreadState};
use queue::QueueStatus;
use scheduler::CpuSched;

/// How a send that is being aborted ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortState {
    /// The receiver took the message before the abort.
    Done,
    /// The sender was taken off the sender list; the message was not sent.
    Cancel,
    /// The receiver is copying the message right now.
    InProgress,
}

/// Offers the message of `sender` to `receiver`.
///
/// If `receiver` does not accept it and `may_block` is set, `sender` is put on
/// its sender list by priority. On failure the error is in the sender's UTCB.
pub(crate) fn check_sender(receiver: &Context, sender: &ContextRef, may_block: bool) -> CheckSender {
    if receiver.state().contains(ThreadState::DEAD) {
        sender.utcb().error = L4Error::NotExistent;
        return CheckSender::Failed;
    }
    if !receiver::sender_ok(receiver, sender) {
        if !may_block {
            sender.utcb().error = L4Error::Timeout;
            return CheckSender::Failed;
        }
        receiver.sender_list().q_lock().enqueue_prio(sender.clone(), sender.sched().effective_prio());
        debug!("{:?} queued on {:?}", sender, receiver);
        return CheckSender::Queued;
    }
    CheckSender::Ok
}

/// The local handshake of the send phase.
pub(crate) fn handshake_receiver(me: &ContextRef, partner: &ContextRef) -> CheckSender {
    let may_block = !me.ipc().wait.timeout.snd.is_zero();
    match check_sender(partner, me, may_block) {
        CheckSender::Queued => {
            me.state_add_dirty(ThreadState::SEND_WAIT);
            CheckSender::Queued
        }
        CheckSender::Ok => {
            partner.state_change_dirty(ThreadState::IPC_MASK | ThreadState::READY, ThreadState::IPC_TRANSFER);
            CheckSender::Ok
        }
        other => other,
    }
}

pub(crate) fn after_handshake(cs: &mut CpuSched, me: &ContextRef, partner: &ContextRef, result: CheckSender) -> IpcOutcome {
    match result {
        CheckSender::Done => send_done(cs, me),
        CheckSender::Queued => start_send_wait(cs, me, partner),
        CheckSender::Failed => {
            me.state_del_dirty(ThreadState::IPC_MASK);
            send_failed(cs, me)
        }
        CheckSender::Ok => {
            cs.reset_timeout(partner);
            let wait = wait_of(me);
            transfer_msg(me, partner, wait.tag, wait.label, wait.send_rights);
            me.state_del_dirty(ThreadState::IPC_MASK);
            if wait.have_receive {
                me.state_add_dirty(ThreadState::RECEIVE_WAIT);
            }
            let activate = if context::same(me, partner) { None } else { Some(partner.clone()) };
            receiver::receive(cs, me, activate)
        }
    }
}

/// Copies the message of `sender` into `receiver`: the UTCB words the tag
/// covers, the tag and the label. On a call, `receiver` gets the reply capability.
pub(crate) fn transfer_msg(sender: &ContextRef, receiver: &Context, tag: MsgTag, label: Mword, rights: Rights) {
    let words = tag.words();
    let mut buf = [0 as Mword; Utcb::MAX_WORDS];
    buf[..words].copy_from_slice(&sender.utcb().values[..words]);
    receiver.utcb().values[..words].copy_from_slice(&buf[..words]);
    {
        let mut frame = receiver.frame();
        frame.set_tag(tag.without_flags(TagFlags::ERROR));
        frame.set_from(label);
    }
    if sender.is_partner(receiver) {
        receiver.set_caller(sender, rights);
    }
    trace!("transferred {:?} from {:?} to {:?}", tag, sender, receiver);
}

/// The send phase failed; the receive phase is skipped.
pub(crate) fn send_failed(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    me.frame().set_tag(MsgTag::new(0, 0, TagFlags::ERROR, 0));
    receiver::finish(cs, me)
}

/// The message was delivered; go on with the receive phase, if there is one.
pub(crate) fn send_done(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    receiver::receive(cs, me, None)
}

/// Arms the send timeout and waits in the partner's sender list.
pub(crate) fn start_send_wait(cs: &mut CpuSched, me: &ContextRef, partner: &ContextRef) -> IpcOutcome {
    let snd = me.ipc().wait.timeout.snd;
    if snd.is_finite() {
        let clock = cs.clock();
        let wakeup = snd.microsecs(clock, &me.utcb());
        if wakeup <= clock {
            return abort(cs, me, partner, L4Error::Timeout);
        }
        cs.set_timeout(me, me.ipc_timeout(), wakeup);
    }
    send_wait(cs, me)
}

pub(crate) fn send_wait(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    let state = me.state() & (ThreadState::SEND_WAIT | ThreadState::IPC_ABORT_MASK);
    if state == ThreadState::SEND_WAIT {
        return block(cs, me, IpcPhase::SendWait);
    }
    cs.reset_timeout(me);

    if state.contains(ThreadState::SEND_WAIT) {
        if state.contains(ThreadState::CANCELED) {
            // the receiver went away
            me.state_del_dirty(ThreadState::FULL_IPC_MASK);
            me.utcb().error = L4Error::NotExistent;
            return send_failed(cs, me);
        }
        let err = if state.contains(ThreadState::TIMEOUT) && !state.contains(ThreadState::CANCEL) {
            L4Error::Timeout
        } else {
            L4Error::Canceled
        };
        let partner = me.ipc().wait.send_partner();
        return match partner {
            Some(partner) => abort(cs, me, &partner, err),
            None => {
                me.state_del_dirty(ThreadState::FULL_IPC_MASK);
                me.utcb().error = L4Error::NotExistent;
                send_failed(cs, me)
            }
        };
    }

    // taken by the receiver; a send timeout that hit meanwhile is stale
    me.state_del_dirty(ThreadState::TIMEOUT);
    send_done(cs, me)
}

/// Takes `me` off the sender list of `partner`, unless the receiver has the
/// message already.
pub fn abort_send(me: &Context, partner: &Context) -> AbortState {
    me.state_del_dirty(ThreadState::FULL_IPC_MASK);
    let state = if partner.sender_list().dequeue(me, QueueStatus::Invalid) {
        AbortState::Cancel
    } else if partner.in_ipc(me) {
        AbortState::InProgress
    } else {
        AbortState::Done
    };
    debug!("abort_send: {:?} -> {:?}: {:?}", me, partner, state);
    state
}

fn abort(cs: &mut CpuSched, me: &ContextRef, partner: &ContextRef, err: L4Error) -> IpcOutcome {
    match abort_send(me, partner) {
        AbortState::Cancel => {
            me.utcb().error = err;
            send_failed(cs, me)
        }
        AbortState::InProgress => {
            me.state_add_dirty(ThreadState::IPC_TRANSFER);
            abort_wait(cs, me)
        }
        AbortState::Done => delivered_during_abort(cs, me),
    }
}

/// Waits until the receiver that raced with an abort has the message.
pub(crate) fn abort_wait(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    if me.state().contains(ThreadState::IPC_TRANSFER) {
        return block(cs, me, IpcPhase::AbortWait);
    }
    delivered_during_abort(cs, me)
}

/// The abort cleared all IPC bits, possibly after the receiver had already
/// switched us to the receive phase.
fn delivered_during_abort(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    let have_receive = me.ipc().wait.have_receive;
    if have_receive {
        me.state_add_dirty(ThreadState::RECEIVE_WAIT);
    }
    send_done(cs, me)
}
