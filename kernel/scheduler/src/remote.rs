//! Talking to other CPUs: state changes of remote contexts, remote calls and
//! draining the local DRQ inbox.

use crate::CpuSched;
use alloc::boxed::Box;
use context::{ContextRef, DrqRequest, ThreadState};
use cpu::CpuId;

impl CpuSched {
    /// Clears `del` and sets `add` in the state of `ctx`, deblocking it if
    /// `add` makes it ready.
    ///
    /// If `ctx` is homed on another CPU, the change is posted to that CPU and
    /// false is returned. Otherwise returns whether `ctx` should preempt the
    /// current context; with `lazy`, it is then not enqueued.
    pub fn xcpu_state_change(&mut self, ctx: &ContextRef, del: ThreadState, add: ThreadState, lazy: bool) -> bool {
        if ctx.home_cpu() != self.cpu {
            self.machine.post(ctx.home_cpu(), DrqRequest::StateChange { ctx: ctx.clone(), del, add });
            return false;
        }
        ctx.state_change_dirty(del, add);
        if add.intersects(ThreadState::READY_MASK) {
            self.deblock(ctx, lazy)
        } else {
            false
        }
    }

    /// Runs `f` on `target`: right away if `target` is this CPU, otherwise
    /// when `target` drains its inbox.
    pub fn remote_call<F>(&mut self, target: CpuId, f: F)
    where
        F: FnOnce(&mut CpuSched) + Send + 'static,
    {
        if self.machine.route(target) == self.cpu {
            f(self);
        } else {
            self.machine.post(target, DrqRequest::Call(Box::new(f)));
        }
    }

    /// Processes every request waiting in this CPU's inbox.
    ///
    /// Returns whether a reschedule is needed, counting one requested through
    /// [`request_resched()`](CpuSched::request_resched) before or during the call.
    pub fn handle_drq(&mut self) -> bool {
        loop {
            let drq = match self.machine.inbox(self.cpu).q_lock().pop_front() {
                Some(drq) => drq,
                None => break,
            };
            let request = match drq.take() {
                Some(request) => request,
                None => continue,
            };
            debug!("CPU {}: handling DRQ {:?}", self.cpu, request);

            match request {
                DrqRequest::StateChange { ctx, del, add } => {
                    if !self.adopt_or_forward(&ctx) {
                        self.machine.post(ctx.home_cpu(), DrqRequest::StateChange { ctx: ctx.clone(), del, add });
                    } else if self.xcpu_state_change(&ctx, del, add, false) {
                        self.need_resched = true;
                    }
                    ctx.drq_handled();
                }
                DrqRequest::Migrate { ctx, timeout } => {
                    if self.finish_migration(&ctx, timeout) {
                        self.need_resched = true;
                    }
                    ctx.drq_handled();
                }
                DrqRequest::Call(f) => f(self),
            }
        }
        core::mem::take(&mut self.need_resched)
    }

    /// Whether a request about `ctx` is to be handled here. A context whose
    /// home went offline is adopted; one that has moved on is not ours.
    pub fn adopt_or_forward(&self, ctx: &ContextRef) -> bool {
        let home = ctx.home_cpu();
        if home == self.cpu {
            true
        } else if !self.machine.is_online(home) && self.machine.route(home) == self.cpu {
            debug!("CPU {}: adopting {:?} from offline CPU {}", self.cpu, ctx, home);
            ctx.set_home_cpu(self.cpu);
            true
        } else {
            false
        }
    }
}
