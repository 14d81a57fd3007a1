//! Moving contexts between CPUs, and emptying a CPU that goes offline.

use crate::CpuSched;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use context::{Context, ContextRef, DrqRequest, HelpingMode, ThreadState};
use cpu::CpuId;
use timeout::{Timeout, TimeoutRef};

impl CpuSched {
    /// Moves `ctx` from this CPU to `target`.
    ///
    /// `ctx` leaves the ready list here and gets a fresh quantum; its armed
    /// timeout is disarmed and travels along. The target CPU finishes the
    /// move when it handles the `Migrate` request, see [`handle_drq()`](Self::handle_drq).
    /// If `target` is offline, the boot CPU takes `ctx` instead.
    pub fn migrate(&mut self, ctx: &ContextRef, target: CpuId) -> Result<(), &'static str> {
        if ctx.home_cpu() != self.cpu {
            return Err("can only migrate contexts homed on this CPU");
        }
        let target = self.machine.route(target);
        if target == self.cpu {
            return Ok(());
        }

        let timeout = ctx.timeout();
        if let Some(to) = &timeout {
            self.timeouts.reset(&**to);
        }
        self.rq.ready_dequeue(ctx.sched());
        if ready_queue::same_opt(self.rq.current_sched(), Some(ctx.sched())) {
            self.rq.invalidate_sched();
        }
        ctx.sched().replenish();
        ctx.state_add_dirty(ThreadState::FINISH_MIGRATION);
        ctx.set_home_cpu(target);
        debug!("CPU {}: migrating {:?} to CPU {}", self.cpu, ctx, target);
        self.machine.post(target, DrqRequest::Migrate { ctx: ctx.clone(), timeout });

        if context::same(&self.current, ctx) {
            self.schedule();
        }
        Ok(())
    }

    /// Completes the migration of `ctx` to this CPU. Returns whether it should preempt.
    pub(crate) fn finish_migration(&mut self, ctx: &ContextRef, timeout: Option<TimeoutRef>) -> bool {
        if !self.adopt_or_forward(ctx) {
            // it moved on before we got here
            self.machine.post(ctx.home_cpu(), DrqRequest::Migrate { ctx: ctx.clone(), timeout });
            return false;
        }
        if let Some(to) = timeout {
            if !to.timeout_state().is_set() {
                self.timeouts.set_again(to);
                self.update_timer();
            }
        }
        ctx.state_del_dirty(ThreadState::FINISH_MIGRATION);
        debug!("CPU {}: {:?} arrived", self.cpu, ctx);
        if ctx.is_ready() {
            self.deblock(ctx, false)
        } else {
            false
        }
    }

    /// Empties this CPU after it was marked offline. Returns the number of
    /// contexts moved to the boot CPU.
    pub(crate) fn evacuate(&mut self) -> usize {
        if !context::same(&self.current, &self.idle) {
            let idle = self.idle.clone();
            if self.switch_exec_locked(&idle, HelpingMode::NotHelping) == crate::Switch::Failed {
                error!("CPU {}: could not switch to idle before going offline", self.cpu);
            }
        }

        let mut moved = 0;
        for sc in self.rq.drain() {
            let ctx = match sc.owner::<Context>() {
                Some(ctx) => ctx,
                None => continue,
            };
            if ctx.home_cpu() == self.cpu && self.migrate(&ctx, CpuId::BOOT).is_ok() {
                moved += 1;
            }
        }
        self.rq.invalidate_sched();

        // timeouts of blocked contexts; they are adopted when they wake up
        let timeslice = Arc::as_ptr(&self.timeslice) as *const ();
        let orphans: Vec<TimeoutRef> = self.timeouts
            .drain()
            .into_iter()
            .filter(|to| Arc::as_ptr(to) as *const () != timeslice)
            .collect();
        if !orphans.is_empty() {
            self.machine.post(CpuId::BOOT, DrqRequest::Call(Box::new(move |boot: &mut CpuSched| {
                for to in orphans {
                    boot.timeouts.set_again(to);
                }
                boot.update_timer();
            })));
        }

        let pending = self.machine.inbox(self.cpu).q_lock().drain(queue::QueueStatus::Ok);
        let mut boot_inbox = self.machine.inbox(CpuId::BOOT).q_lock();
        for drq in pending {
            boot_inbox.enqueue(drq);
        }
        moved
    }
}
