//! Sending to a receiver homed on another CPU.
//!
//! The handshake runs on the receiver's CPU as a posted closure. The sender
//! blocks with `DRQ_WAIT` until that closure has left its verdict in the
//! sender's [`IpcWait::remote_result`](context::IpcWait::remote_result).

use crate::{block, sender, wait_of, IpcOutcome};
use abi::L4Error;
use context::{CheckSender, ContextRef, IpcPhase, ThreadState};
use scheduler::CpuSched;

struct RemoteSend {
    sender: ContextRef,
    partner: ContextRef,
}

pub(crate) fn handshake_receiver(cs: &mut CpuSched, me: &ContextRef, partner: &ContextRef) -> IpcOutcome {
    {
        let mut ipc = me.ipc();
        ipc.wait.remote_result = None;
        // the receiver runs elsewhere, there is nothing to switch to
        ipc.wait.do_switch = false;
    }
    me.state_change_dirty(ThreadState::READY, ThreadState::SEND_WAIT | ThreadState::DRQ_WAIT);
    me.set_ipc_phase(IpcPhase::RemoteSend);
    debug!("{:?}: remote send to {:?} on CPU {}", me, partner, partner.home_cpu());

    let rq = RemoteSend { sender: me.clone(), partner: partner.clone() };
    cs.remote_call(partner.home_cpu(), move |pcs| remote_ipc_send(pcs, rq));
    if me.state().contains(ThreadState::DRQ_WAIT) {
        cs.schedule();
        IpcOutcome::Blocked
    } else {
        // handled right here, the receiver's CPU is offline
        resume_send(cs, me)
    }
}

/// The receiver's half of a remote send, run on the receiver's CPU.
fn remote_ipc_send(pcs: &mut CpuSched, rq: RemoteSend) {
    if !pcs.adopt_or_forward(&rq.partner) {
        // the receiver migrated while the request was in flight
        let home = rq.partner.home_cpu();
        pcs.remote_call(home, move |pcs| remote_ipc_send(pcs, rq));
        return;
    }
    let RemoteSend { sender, partner } = rq;
    let wait = wait_of(&sender);

    let (result, del) = match sender::check_sender(&partner, &sender, !wait.timeout.snd.is_zero()) {
        CheckSender::Queued => (CheckSender::Queued, ThreadState::DRQ_WAIT),
        CheckSender::Ok | CheckSender::Done => {
            pcs.reset_timeout(&partner);
            sender::transfer_msg(&sender, &partner, wait.tag, wait.label, wait.send_rights);
            let next_phase = if wait.have_receive { ThreadState::RECEIVE_WAIT } else { ThreadState::empty() };
            sender.state_change_dirty(ThreadState::SEND_WAIT, next_phase);
            partner.state_change_dirty(ThreadState::IPC_MASK, ThreadState::READY);
            if pcs.deblock(&partner, false) {
                pcs.request_resched();
            }
            (CheckSender::Done, ThreadState::DRQ_WAIT)
        }
        CheckSender::Failed => (CheckSender::Failed, ThreadState::IPC_MASK | ThreadState::DRQ_WAIT),
    };
    debug!("CPU {}: remote send {:?} -> {:?}: {:?}", pcs.cpu(), sender, partner, result);

    sender.ipc().wait.remote_result = Some(result);
    if pcs.xcpu_state_change(&sender, del, ThreadState::READY, false) {
        pcs.request_resched();
    }
}

/// Continues a remote send once the receiver's CPU has answered.
pub(crate) fn resume_send(cs: &mut CpuSched, me: &ContextRef) -> IpcOutcome {
    if me.state().contains(ThreadState::DRQ_WAIT) {
        return block(cs, me, IpcPhase::RemoteSend);
    }
    let (result, partner) = {
        let mut ipc = me.ipc();
        (ipc.wait.remote_result.take(), ipc.wait.send_partner())
    };
    let partner = match partner {
        Some(partner) => partner,
        None => {
            me.state_del_dirty(ThreadState::FULL_IPC_MASK);
            me.utcb().error = L4Error::NotExistent;
            return sender::send_failed(cs, me);
        }
    };

    match result {
        Some(CheckSender::Done) => sender::send_done(cs, me),
        Some(CheckSender::Queued) => sender::start_send_wait(cs, me, &partner),
        _ => {
            me.state_del_dirty(ThreadState::IPC_MASK);
            sender::send_failed(cs, me)
        }
    }
}
