//! The thread object: a capability to a [`Context`].

use crate::{fail, invoke_helper, ipc_to, Invocation, Kobject, Reply, Task};
use abi::{commit_result, commit_result_words, label, ErrorCode, IpcOp, L4Error, Mword, Utcb};
use alloc::sync::Arc;
use context::{Context, ContextRef, DestroyError, HelpingMode, MemSpace, ThreadState};
use cpu::CpuId;
use ipc::IpcOutcome;
use sched_context::SchedContext;
use scheduler::{CpuSched, Switch};

/// The thread operations, in the low half of the first message word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ThreadOp {
    /// Donate the rest of the timeslice to this thread.
    Switch = 2,
    /// Read the CPU time this thread has consumed.
    Stats = 3,
}

impl ThreadOp {
    fn from_word(word: Mword) -> Option<ThreadOp> {
        match word & 0xffff {
            2 => Some(ThreadOp::Switch),
            3 => Some(ThreadOp::Stats),
            _ => None,
        }
    }
}

/// A thread: the kernel object behind a user-visible [`Context`].
pub struct ThreadObject {
    ctx: ContextRef,
}

impl ThreadObject {
    /// Creates a blocked thread of `task` homed on `cpu`, charged to the task's quota.
    pub fn create(name: &str, task: &Arc<Task>, cpu: CpuId, prio: u8) -> Result<Arc<ThreadObject>, ErrorCode> {
        let space: Arc<dyn MemSpace> = task.clone();
        let ctx = Context::new(name, cpu, SchedContext::new(prio, 0), Some(space), Some(task.quota()))
            .map_err(|e| {
                warn!("ThreadObject::create(): {}", e);
                ErrorCode::ENomem
            })?;
        Ok(Arc::new(ThreadObject { ctx }))
    }

    /// The thread object of an existing context.
    pub fn from_context(ctx: ContextRef) -> ThreadObject {
        ThreadObject { ctx }
    }

    pub fn context(&self) -> &ContextRef {
        &self.ctx
    }

    /// Tears the thread down: its queued senders fail, then the context is
    /// marked dead. The thread must not be running, queued or waiting.
    pub fn destroy(&self, cs: &mut CpuSched) -> Result<(), DestroyError> {
        let failed = ipc::ipc_receiver_aborted(cs, &self.ctx);
        if failed > 0 {
            debug!("destroying {:?} failed {} senders", self.ctx, failed);
        }
        self.ctx.destroy()
    }

    fn kinvoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>, input: &Utcb, out: &mut Utcb) -> Reply {
        if inv.tag.words() < 1 {
            return Reply::Tag(ErrorCode::EMsgtooshort.result());
        }
        match ThreadOp::from_word(input.values[0]) {
            Some(ThreadOp::Switch) => self.sys_thread_switch(cs, inv, out),
            Some(ThreadOp::Stats) => self.sys_thread_stats(cs, inv, out),
            None => Reply::Tag(ErrorCode::ENosys.result()),
        }
    }

    fn sys_thread_switch(&self, cs: &mut CpuSched, inv: &Invocation<'_>, out: &mut Utcb) -> Reply {
        let me = &inv.caller;
        if context::same(me, &self.ctx) || self.ctx.home_cpu() != cs.cpu() {
            return Reply::Tag(commit_result(0));
        }

        if self.ctx.is_ready() {
            debug!("{:?} switches to {:?}", me, self.ctx);
            if cs.switch_exec_locked(&self.ctx, HelpingMode::NotHelping) != Switch::Ok {
                cs.schedule();
            }
            out.values[0] = 0;
        } else {
            out.values[0] = cs.timeslice_left() as Mword;
            cs.schedule();
        }
        Reply::Tag(commit_result_words(0, 1))
    }

    fn sys_thread_stats(&self, cs: &mut CpuSched, inv: &Invocation<'_>, out: &mut Utcb) -> Reply {
        if self.ctx.home_cpu() == cs.cpu() {
            out.values[0] = self.ctx.consumed_time() as Mword;
            return Reply::Tag(commit_result_words(0, 1));
        }

        let have_recv = inv.obj_ref.have_recv();
        let target = self.ctx.clone();
        let outcome = ipc::call_remote(cs, target.home_cpu(), move |_, waiter| {
            if have_recv {
                waiter.utcb().values[0] = target.consumed_time() as Mword;
            }
            waiter.frame().set_tag(commit_result_words(0, 1));
        });
        Reply::Committed(outcome)
    }
}

impl Kobject for ThreadObject {
    fn kind(&self) -> &'static str {
        "thread"
    }

    fn invoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>) -> IpcOutcome {
        let op = inv.obj_ref.op();
        let is_ipc = (!op.is_empty() && !op.contains(IpcOp::SEND))
            || op.contains(IpcOp::REPLY)
            || inv.tag.proto() != label::THREAD;
        if is_ipc {
            return ipc_to(cs, inv, &self.ctx, inv.label);
        }
        if self.ctx.state().contains(ThreadState::DEAD) {
            return fail(&inv.caller, L4Error::NotExistent);
        }
        invoke_helper(cs, inv, |cs, input, out| self.kinvoke(cs, inv, input, out))
    }

    fn as_thread(&self) -> Option<&ThreadObject> {
        Some(self)
    }
}
