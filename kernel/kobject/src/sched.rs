//! The scheduler object: CPU information, thread placement and idle time.

use crate::{invoke_helper, Invocation, Kobject, Reply};
use abi::{commit_result, commit_result_words, label, ErrorCode, Mword, ObjRef, SchedParam, SchedParamMsg, Utcb};
use context::{ContextRef, ThreadState};
use cpu::{CpuId, CpuSet};
use ipc::IpcOutcome;
use kernel_config::sched::{MAX_CPUS, MAX_PRIO};
use sched_context::SchedContext;
use scheduler::CpuSched;

/// The scheduler operations, in the first message word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum SchedOp {
    /// The online CPUs, the number of CPUs and the highest priority.
    Info = 0,
    /// Apply scheduling parameters to a thread and let it run.
    RunThread = 1,
    /// The time a CPU has spent idle.
    IdleTime = 2,
}

impl SchedOp {
    fn from_word(word: Mword) -> Option<SchedOp> {
        match word {
            0 => Some(SchedOp::Info),
            1 => Some(SchedOp::RunThread),
            2 => Some(SchedOp::IdleTime),
            _ => None,
        }
    }
}

/// The one scheduler object of the system.
#[derive(Debug, Default)]
pub struct SchedulerObject;

impl SchedulerObject {
    pub fn new() -> SchedulerObject {
        SchedulerObject
    }

    fn sys_info(&self, cs: &mut CpuSched, input: &Utcb, out: &mut Utcb) -> Reply {
        let set = CpuSet::from_words(input.values[1] as u64, 0);
        let offset = set.offset() as usize;
        if offset >= MAX_CPUS {
            return Reply::Tag(ErrorCode::ERange.result());
        }

        let mut map: u64 = 0;
        for cpu in cs.machine().online().iter() {
            if cpu.index() < offset {
                continue;
            }
            let bit = (cpu.index() - offset).checked_shr(set.granularity() as u32).unwrap_or(0);
            if bit < u64::BITS as usize {
                map |= 1 << bit;
            }
        }
        out.values[0] = map as Mword;
        out.values[1] = cs.machine().num_cpus();
        out.values[2] = MAX_PRIO as Mword;
        Reply::Tag(commit_result_words(0, 3))
    }

    fn sys_run_thread(&self, cs: &mut CpuSched, inv: &Invocation<'_>, input: &Utcb) -> Reply {
        let tag = inv.tag;
        if tag.words() < 5 {
            return Reply::Tag(ErrorCode::EInval.result());
        }
        let msg = match SchedParamMsg::decode(&input.values[1..tag.words()]) {
            Ok(msg) => msg,
            Err(e) => return Reply::Tag(e.result()),
        };
        if tag.items() < 1 {
            return Reply::Tag(ErrorCode::EInval.result());
        }
        let cap = match input.values.get(tag.words()) {
            Some(&word) => ObjRef::from_raw(word).cap(),
            None => return Reply::Tag(ErrorCode::EInval.result()),
        };
        let thread = match inv.task.lookup(cap) {
            Some((obj, _)) => match obj.as_thread() {
                Some(thread) => thread.context().clone(),
                None => return Reply::Tag(ErrorCode::EInval.result()),
            },
            None => return Reply::Tag(ErrorCode::ENoent.result()),
        };
        if let Err(e) = SchedContext::check(&msg.param) {
            return Reply::Tag(ErrorCode::from(e).result());
        }

        let machine = cs.machine();
        let home = thread.home_cpu();
        let target = if machine.is_online(home) && msg.cpus.contains(home) {
            home
        } else if msg.cpus.contains(cs.cpu()) {
            cs.cpu()
        } else {
            match msg.cpus.first(machine.online()) {
                Some(cpu) => cpu,
                None => return Reply::Tag(ErrorCode::EInval.result()),
            }
        };

        debug!("run_thread: {:?} on CPU {} with {:?}", thread, target, msg.param);
        let param = msg.param;
        cs.remote_call(home, move |pcs| run_thread(pcs, thread, param, target));
        Reply::Tag(commit_result(0))
    }

    fn sys_idle_time(&self, cs: &mut CpuSched, inv: &Invocation<'_>, input: &Utcb) -> Reply {
        let set = CpuSet::from_words(input.values[1] as u64, input.values[2] as u64);
        let cpu = match set.first(cs.machine().online()) {
            Some(cpu) => cpu,
            None => return Reply::Tag(ErrorCode::EInval.result()),
        };
        let have_recv = inv.obj_ref.have_recv();
        let outcome = ipc::call_remote(cs, cpu, move |pcs, waiter| {
            if have_recv {
                waiter.utcb().values[0] = pcs.idle_time() as Mword;
            }
            waiter.frame().set_tag(commit_result_words(0, 1));
        });
        Reply::Committed(outcome)
    }

    fn kinvoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>, input: &Utcb, out: &mut Utcb) -> Reply {
        if inv.tag.proto() != label::SCHEDULER {
            return Reply::Tag(ErrorCode::EBadproto.result());
        }
        if inv.tag.words() < 1 {
            return Reply::Tag(ErrorCode::EInval.result());
        }
        match SchedOp::from_word(input.values[0]) {
            Some(SchedOp::Info) => self.sys_info(cs, input, out),
            Some(SchedOp::RunThread) => self.sys_run_thread(cs, inv, input),
            Some(SchedOp::IdleTime) => self.sys_idle_time(cs, inv, input),
            None => Reply::Tag(ErrorCode::ENosys.result()),
        }
    }
}

/// Applies `param` to `ctx` on its home CPU, moves it to `target` and makes it run.
///
/// A thread blocked in an IPC keeps waiting with its new parameters.
fn run_thread(pcs: &mut CpuSched, ctx: ContextRef, param: SchedParam, target: CpuId) {
    if !pcs.adopt_or_forward(&ctx) {
        let home = ctx.home_cpu();
        pcs.remote_call(home, move |pcs| run_thread(pcs, ctx, param, target));
        return;
    }
    if ctx.state().contains(ThreadState::DEAD) {
        warn!("run_thread: {:?} is dead", ctx);
        return;
    }

    let queued = ctx.sched().in_ready_list();
    pcs.rq_mut().ready_dequeue(ctx.sched());
    if let Err(e) = ctx.sched().set(&param) {
        error!("run_thread: {:?} rejected {:?}: {:?}", ctx, param, e);
    }
    if queued {
        pcs.rq_mut().ready_enqueue(ctx.sched());
    }
    pcs.request_resched();

    if target != pcs.cpu() {
        if let Err(e) = pcs.migrate(&ctx, target) {
            error!("run_thread: cannot migrate {:?}: {}", ctx, e);
        }
    }
    if !ctx.state().intersects(ThreadState::IPC_MASK | ThreadState::DRQ_WAIT) {
        pcs.activate(&ctx);
    }
}

impl Kobject for SchedulerObject {
    fn kind(&self) -> &'static str {
        "scheduler"
    }

    fn invoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>) -> IpcOutcome {
        invoke_helper(cs, inv, |cs, input, out| self.kinvoke(cs, inv, input, out))
    }
}
