//! Synchronous message passing between contexts.
//!
//! [`do_ipc()`] runs one IPC operation on behalf of the current context of a
//! [`CpuSched`]: an optional send phase to a partner, followed by an optional
//! receive phase that either waits for one named sender (closed wait) or takes
//! whoever comes first (open wait).
//!
//! An operation that has to wait does not hold on to the CPU. It records where
//! it stopped in the context's [`IpcWait`], blocks the context and returns
//! [`IpcOutcome::Blocked`]. Once the context runs again, [`resume()`] picks the
//! operation up at that point; [`finish_ipc()`] keeps resuming until the CPU
//! runs a context with nothing pending.
//!
//! The result of an operation is reported through the caller's
//! [`SyscallFrame`](abi::SyscallFrame) tag and the error word of its UTCB.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

mod receiver;
mod remote;
mod sender;
mod wait;

pub use receiver::{ipc_receiver_aborted, sender_ok, setup_timer};
pub use sender::{abort_send, AbortState};
pub use wait::{call_remote, wait_on_queue};

use abi::{Mword, MsgTag, Rights, TimeoutPair};
use alloc::sync::Arc;
use context::{Context, ContextRef, IpcPhase, IpcWait, ThreadState};
use scheduler::CpuSched;

/// How far an IPC operation got before returning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcOutcome {
    /// The result is committed to the caller's frame.
    Done,
    /// The caller is blocked; [`resume()`] continues the operation once it runs again.
    Blocked,
}

/// The parameters of one [`do_ipc()`] call.
#[derive(Clone)]
pub struct IpcRequest {
    pub tag: MsgTag,
    /// The receiver of the send phase; no send phase if `None`.
    pub partner: Option<ContextRef>,
    pub have_receive: bool,
    /// The only sender the receive phase accepts; any sender if `None`.
    pub closed_sender: Option<ContextRef>,
    pub timeout: TimeoutPair,
    /// The rights the receiver gets on the reply capability.
    pub rights: Rights,
    /// The label delivered to the receiver.
    pub label: Mword,
}

impl IpcRequest {
    fn new(tag: MsgTag, partner: Option<ContextRef>, have_receive: bool, closed_sender: Option<ContextRef>) -> IpcRequest {
        IpcRequest {
            tag,
            partner,
            have_receive,
            closed_sender,
            timeout: TimeoutPair::NEVER,
            rights: Rights::empty(),
            label: 0,
        }
    }

    /// Send `tag` to `partner`, without a receive phase.
    pub fn send(partner: &ContextRef, tag: MsgTag) -> IpcRequest {
        IpcRequest::new(tag, Some(partner.clone()), false, None)
    }

    /// Send `tag` to `partner`, then wait for its answer.
    pub fn call(partner: &ContextRef, tag: MsgTag) -> IpcRequest {
        IpcRequest::new(tag, Some(partner.clone()), true, Some(partner.clone()))
    }

    /// Send `tag` to `partner`, then wait for any sender.
    pub fn send_and_wait(partner: &ContextRef, tag: MsgTag) -> IpcRequest {
        IpcRequest::new(tag, Some(partner.clone()), true, None)
    }

    /// Wait for any sender.
    pub fn wait() -> IpcRequest {
        IpcRequest::new(MsgTag::default(), None, true, None)
    }

    /// Wait for a message from `sender` only.
    pub fn receive(sender: &ContextRef) -> IpcRequest {
        IpcRequest::new(MsgTag::default(), None, true, Some(sender.clone()))
    }

    pub fn with_timeout(mut self, timeout: TimeoutPair) -> IpcRequest {
        self.timeout = timeout;
        self
    }

    pub fn with_label(mut self, label: Mword) -> IpcRequest {
        self.label = label;
        self
    }

    pub fn with_rights(mut self, rights: Rights) -> IpcRequest {
        self.rights = rights;
        self
    }
}

/// Performs `req` on behalf of the current context of `cs`.
///
/// # Panics
/// If the current context is already in an IPC operation, or if `req` has
/// neither a send nor a receive phase.
pub fn do_ipc(cs: &mut CpuSched, req: IpcRequest) -> IpcOutcome {
    let me = cs.current().clone();
    assert!(
        !me.state().intersects(ThreadState::IPC_MASK),
        "do_ipc(): {:?} is already in an IPC operation", me
    );
    assert!(req.partner.is_some() || req.have_receive, "do_ipc(): no send and no receive phase");
    debug!("do_ipc: {:?} -> {:?} {:?}, receive: {}, closed: {}",
        me, req.partner, req.tag, req.have_receive, req.closed_sender.is_some());

    me.set_partner(req.closed_sender.as_ref());
    me.ipc().wait = IpcWait {
        tag: req.tag,
        send_partner: req.partner.as_ref().map(Arc::downgrade),
        send_rights: req.rights,
        label: req.label,
        have_receive: req.have_receive,
        closed_wait: req.closed_sender.is_some(),
        timeout: req.timeout,
        do_switch: req.tag.do_switch(),
        ..IpcWait::default()
    };

    match req.partner {
        Some(partner) if partner.home_cpu() == cs.cpu() => {
            let result = sender::handshake_receiver(&me, &partner);
            sender::after_handshake(cs, &me, &partner, result)
        }
        Some(partner) => remote::handshake_receiver(cs, &me, &partner),
        None => {
            me.state_add_dirty(ThreadState::RECEIVE_WAIT);
            receiver::receive(cs, &me, None)
        }
    }
}

/// Continues the pending IPC operation of the current context of `cs`.
pub fn resume(cs: &mut CpuSched) -> IpcOutcome {
    let me = cs.current().clone();
    let phase = me.ipc_phase();
    trace!("resume: {:?} at {:?}", me, phase);
    match phase {
        IpcPhase::Idle => IpcOutcome::Done,
        IpcPhase::RemoteSend => remote::resume_send(cs, &me),
        IpcPhase::SendWait => sender::send_wait(cs, &me),
        IpcPhase::AbortWait => sender::abort_wait(cs, &me),
        IpcPhase::Receive => receiver::receive(cs, &me, None),
        IpcPhase::ReceiveWait => receiver::receive_wait(cs, &me),
        IpcPhase::QueueWait => wait::queue_wait(cs, &me),
        IpcPhase::RemoteCall => wait::remote_call_wait(cs, &me),
        IpcPhase::Finish => receiver::finish(cs, &me),
    }
}

/// Resumes pending operations until the current context of `cs` has none left.
pub fn finish_ipc(cs: &mut CpuSched) {
    while cs.current().ipc_pending() {
        resume(cs);
    }
}

/// Aborts the IPC operation `ctx` is blocked in, if any. Returns whether it was in one.
///
/// A sender gets [`Canceled`](abi::L4Error::Canceled), a receiver
/// [`RCanceled`](abi::L4Error::RCanceled) once it runs again.
pub fn cancel(cs: &mut CpuSched, ctx: &ContextRef) -> bool {
    if !ctx.state().intersects(ThreadState::IPC_MASK) {
        return false;
    }
    debug!("cancel: {:?}", ctx);
    if cs.xcpu_state_change(ctx, ThreadState::empty(), ThreadState::CANCEL | ThreadState::READY, false) {
        cs.request_resched();
    }
    true
}

/// Parks the current context at `phase` and picks another one to run.
pub(crate) fn block(cs: &mut CpuSched, me: &Context, phase: IpcPhase) -> IpcOutcome {
    debug_assert!(context::same(cs.current(), me), "block(): {:?} is not running", me);
    me.set_ipc_phase(phase);
    me.state_del_dirty(ThreadState::READY);
    trace!("{:?} blocks at {:?}", me, phase);
    cs.schedule();
    IpcOutcome::Blocked
}

pub(crate) fn wait_of(ctx: &Context) -> IpcWait {
    ctx.ipc().wait.clone()
}
