//! Kernel objects: what a capability names and what an invocation acts on.
//!
//! A task's [`CapTable`] maps capability indices to [`Kobject`]s together with
//! the [`Rights`] the task holds on them. [`sys_invoke()`] resolves the
//! selector of an invocation and hands it to the object:
//! * a [`ThreadObject`] either takes part in an IPC or runs a thread operation,
//! * an [`IpcGate`] forwards the message to the thread bound to it, with its label,
//! * a [`Semaphore`] and the [`SchedulerObject`] answer kernel protocol messages.
//!
//! Objects that answer protocol messages go through [`invoke_helper()`], which
//! runs the object's handler on a copy of the caller's message registers and
//! then either commits the reply or, if the handler asked for it, starts the
//! caller's receive phase.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;


mod cap_table;
mod ipc_gate;
mod sched;
mod semaphore;
mod syscall;
mod thread;

pub use cap_table::{CapTable, Task};
pub use ipc_gate::IpcGate;
pub use sched::{SchedOp, SchedulerObject};
pub use semaphore::Semaphore;
pub use syscall::{return_to_user, sys_invoke};
pub use thread::{ThreadObject, ThreadOp};

use abi::{commit_error, IpcOp, L4Error, Mword, MsgTag, ObjRef, Rights, TagFlags, TimeoutPair, Utcb};
use alloc::sync::Arc;
use context::{Context, ContextRef};
use ipc::{IpcOutcome, IpcRequest};
use scheduler::CpuSched;

/// A strong reference to any kernel object.
pub type KobjectRef = Arc<dyn Kobject>;

/// Something a capability can name.
pub trait Kobject: Send + Sync {
    /// A short name of the object's type, for log messages.
    fn kind(&self) -> &'static str;

    /// Handles `inv`, issued by the current context of `cs`.
    ///
    /// The result is committed to the invoker's frame, unless the invoker
    /// blocked, in which case it is committed once the operation completes.
    fn invoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>) -> IpcOutcome;

    fn as_thread(&self) -> Option<&ThreadObject> {
        None
    }
}

/// One invocation of a kernel object, as decoded from the invoker's frame.
pub struct Invocation<'a> {
    /// The invoking context, current on the CPU at entry.
    pub caller: ContextRef,
    /// The task whose capability table resolves selectors in the message.
    pub task: &'a Task,
    pub obj_ref: ObjRef,
    /// The rights the invoker holds on the object.
    pub rights: Rights,
    pub tag: MsgTag,
    pub timeout: TimeoutPair,
    /// The label word of the invoker's frame.
    pub label: Mword,
}

/// What a protocol handler run by [`invoke_helper()`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// Commit this tag to the invoker, together with the reply words.
    Tag(MsgTag),
    /// The handler dealt with the invoker's frame itself, or will once the
    /// invoker resumes.
    Committed(IpcOutcome),
}

/// The tag a protocol handler returns when the invoker gets no answer.
pub fn no_reply() -> MsgTag {
    MsgTag::new(0, 0, TagFlags::SCHEDULE, 0)
}

/// A scratch UTCB for reply words nobody is going to read.
pub fn utcb_dummy() -> Utcb {
    Utcb::new()
}

/// Runs the protocol handler `kinvoke` of an object for `inv`.
///
/// `kinvoke` reads the invoker's message from a snapshot of its UTCB and
/// writes its reply words into a scratch UTCB. Those are copied back only if
/// the invoker asked for a receive phase. An error tag (with the error flag)
/// also copies the scratch UTCB's error word.
///
/// A reply tag with [`SCHEDULE`](abi::TagFlags::SCHEDULE) set (see
/// [`no_reply()`]) does not answer: it starts the invoker's receive phase, a
/// closed wait for the invoker's own caller or an open wait if it asked for one.
pub fn invoke_helper<F>(cs: &mut CpuSched, inv: &Invocation<'_>, kinvoke: F) -> IpcOutcome
where
    F: FnOnce(&mut CpuSched, &Utcb, &mut Utcb) -> Reply,
{
    let input = inv.caller.utcb().clone();
    let mut out = utcb_dummy();
    let tag = match kinvoke(cs, &input, &mut out) {
        Reply::Tag(tag) => tag,
        Reply::Committed(outcome) => return outcome,
    };

    if tag.has_error() {
        inv.caller.utcb().error = out.error;
        inv.caller.frame().set_tag(tag);
        return IpcOutcome::Done;
    }

    let have_recv = inv.obj_ref.have_recv();
    if have_recv && !tag.do_switch() && context::same(cs.current(), &inv.caller) {
        let closed = if inv.obj_ref.op().contains(IpcOp::OPEN_WAIT) {
            None
        } else {
            inv.caller.caller().map(|(caller, _)| caller)
        };
        let req = IpcRequest {
            tag: MsgTag::default(),
            partner: None,
            have_receive: true,
            closed_sender: closed,
            timeout: inv.timeout,
            rights: Rights::empty(),
            label: 0,
        };
        return ipc::do_ipc(cs, req);
    }

    if have_recv {
        let words = tag.words();
        inv.caller.utcb().values[..words].copy_from_slice(&out.values[..words]);
    }
    inv.caller.frame().set_tag(tag);
    IpcOutcome::Done
}

/// Runs the IPC part of an invocation of `target`, a thread or the thread an
/// IPC gate is bound to, delivering `label`.
///
/// A receive phase waits for `target` alone unless an open wait was asked
/// for. Without any operation bits the invocation is a call. An invocation
/// that ends up with neither a partner nor a receive phase fails with
/// [`NotExistent`](L4Error::NotExistent).
pub(crate) fn ipc_to(cs: &mut CpuSched, inv: &Invocation<'_>, target: &ContextRef, label: Mword) -> IpcOutcome {
    let op = inv.obj_ref.op();
    let mut req = IpcRequest {
        tag: inv.tag,
        partner: None,
        have_receive: false,
        closed_sender: None,
        timeout: inv.timeout,
        rights: inv.rights,
        label,
    };

    if op.is_empty() {
        req.partner = Some(target.clone());
        req.closed_sender = Some(target.clone());
        req.have_receive = true;
    } else {
        if op.contains(IpcOp::RECV) {
            req.have_receive = true;
            if !op.contains(IpcOp::OPEN_WAIT) {
                req.closed_sender = Some(target.clone());
            }
        }
        if op.contains(IpcOp::SEND) {
            req.partner = Some(target.clone());
        }
    }

    if req.partner.is_none() && !req.have_receive {
        return fail(&inv.caller, L4Error::NotExistent);
    }
    ipc::do_ipc(cs, req)
}

/// Fails an invocation before anything happened.
pub(crate) fn fail(ctx: &Context, err: L4Error) -> IpcOutcome {
    debug!("{:?}: invocation failed with {:?}", ctx, err);
    let tag = commit_error(&mut ctx.utcb(), err, MsgTag::default());
    ctx.frame().set_tag(tag);
    IpcOutcome::Done
}
