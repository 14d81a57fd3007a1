//! The invoke system call and the way back to user mode.

use crate::{fail, ipc_to, Invocation, Kobject, Task, ThreadObject};
use abi::{IpcOp, L4Error, ObjRef, Rights};
use context::ContextRef;
use ipc::IpcOutcome;
use scheduler::CpuSched;

/// Invokes the object `obj_ref` names on behalf of the current context of
/// `cs`, which belongs to `task`.
///
/// The message tag, the timeouts and the label come from the context's
/// frame. A selector with [`IpcOp::REPLY`] goes to the context's caller,
/// consuming the reply capability; a special selector names the context
/// itself. Anything else is looked up in the task's capability table.
pub fn sys_invoke(cs: &mut CpuSched, task: &Task, obj_ref: ObjRef) -> IpcOutcome {
    let me = cs.current().clone();
    let (tag, timeout, label) = {
        let mut frame = me.frame();
        frame.set_obj_ref(obj_ref);
        (frame.tag(), frame.timeout(), frame.from())
    };
    trace!("sys_invoke: {:?} {:?} {:?}", me, obj_ref, tag);

    let invocation = |rights: Rights| Invocation {
        caller: me.clone(),
        task,
        obj_ref,
        rights,
        tag,
        timeout,
        label,
    };

    if obj_ref.op().contains(IpcOp::REPLY) {
        let (caller, rights) = match me.caller() {
            Some(reply_cap) => reply_cap,
            None => return fail(&me, L4Error::NotExistent),
        };
        me.reset_caller();
        let inv = invocation(rights);
        return ipc_to(cs, &inv, &caller, label);
    }

    if obj_ref.special() {
        if !obj_ref.is_self() {
            return fail(&me, L4Error::NotExistent);
        }
        let inv = invocation(Rights::CRWSD);
        return ThreadObject::from_context(me.clone()).invoke(cs, &inv);
    }

    match task.lookup(obj_ref.cap()) {
        Some((obj, rights)) => {
            let inv = invocation(rights);
            obj.invoke(cs, &inv)
        }
        None => {
            debug!("sys_invoke: {:?} has no capability {:#x}", task, obj_ref.cap());
            fail(&me, L4Error::NotExistent)
        }
    }
}

/// Completes whatever the current context of `cs` is blocked in and handles
/// pending requests, until a context can return to user mode. Returns that context.
pub fn return_to_user(cs: &mut CpuSched) -> ContextRef {
    loop {
        ipc::finish_ipc(cs);
        if !cs.preemption_point() {
            return cs.current().clone();
        }
    }
}
