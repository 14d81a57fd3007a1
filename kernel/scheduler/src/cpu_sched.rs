use crate::{Machine, TimerTickMode};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use context::{ArchSwitch, Context, ContextRef, HelpingMode, ThreadState};
use cpu::CpuId;
use kernel_config::time::{FINE_GRAINED_CPUTIME, ONE_SHOT_MAX_IDLE_US, SCHEDULER_GRANULARITY_US, SCHEDULER_ONE_SHOT};
use ready_queue::ReadyQueue;
use sched_context::SchedContextRef;
use time::{ClockSource, Clock, CpuTime};
use timeout::{ExpiryContext, Timeout, TimeoutQueue, TimeoutRef, TimesliceTimeout};

/// The outcome of a switch to another context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Switch {
    /// The target runs now.
    Ok,
    /// The target runs now, but a DRQ handled on the way asks for a new scheduling decision.
    Resched,
    /// The target cannot run here right now; nothing changed.
    Failed,
}

/// The scheduler of one CPU.
pub struct CpuSched {
    pub(crate) cpu: CpuId,
    pub(crate) machine: Arc<Machine>,
    pub(crate) rq: ReadyQueue,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) timeslice: Arc<TimesliceTimeout>,
    pub(crate) current: ContextRef,
    pub(crate) idle: ContextRef,
    arch: Box<dyn ArchSwitch>,
    clock: Clock,
    ticks: u64,
    /// Whether the timer is programmed for the next timeout instead of ticking periodically.
    pub(crate) one_shot: bool,
    /// The deadline the one-shot timer is programmed for.
    programmed: u64,
    /// The clock at the previous timer interrupt.
    last_tick: u64,
    pub(crate) need_resched: bool,
}

impl CpuSched {
    pub(crate) fn new(
        cpu: CpuId,
        machine: Arc<Machine>,
        arch: Box<dyn ArchSwitch>,
        clock_source: Arc<dyn ClockSource>,
    ) -> Result<CpuSched, &'static str> {
        let idle = Context::new_idle(cpu)?;
        idle.set_running(true);
        let mut rq = ReadyQueue::new();
        rq.set_idle(idle.sched().clone());
        let clock = Clock::new(clock_source, machine.kip());

        let mut cs = CpuSched {
            cpu,
            machine,
            rq,
            timeouts: TimeoutQueue::new(),
            timeslice: TimesliceTimeout::new(),
            current: idle.clone(),
            idle,
            arch,
            clock,
            ticks: 0,
            one_shot: SCHEDULER_ONE_SHOT,
            programmed: 0,
            last_tick: 0,
            need_resched: false,
        };
        let idle_sched = cs.idle.sched().clone();
        cs.set_current_sched(&idle_sched);
        Ok(cs)
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The context executing on this CPU.
    pub fn current(&self) -> &ContextRef {
        &self.current
    }

    pub fn idle(&self) -> &ContextRef {
        &self.idle
    }

    /// The system clock in µs.
    pub fn clock(&self) -> u64 {
        self.machine.clock()
    }

    pub fn rq(&self) -> &ReadyQueue {
        &self.rq
    }

    pub fn rq_mut(&mut self) -> &mut ReadyQueue {
        &mut self.rq
    }

    pub fn timeouts(&self) -> &TimeoutQueue {
        &self.timeouts
    }

    /// The time the idle context has run on this CPU, in µs.
    pub fn idle_time(&self) -> CpuTime {
        self.idle.consumed_time()
    }

    /// What is left of the running timeslice, in µs.
    pub fn timeslice_left(&self) -> u64 {
        let state = self.timeslice.timeout_state();
        let left = state.remaining(self.clock());
        if state.is_set() && left > 0 { left as u64 } else { 0 }
    }

    /// Asks for a scheduling decision at the next opportunity.
    pub fn request_resched(&mut self) {
        self.need_resched = true;
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched
    }

    /// Puts the current context back on the ready list if it is still ready
    /// and still belongs here.
    pub fn update_ready_list(&mut self) {
        let current = &self.current;
        if current.is_ready() && current.home_cpu() == self.cpu {
            self.rq.ready_enqueue(current.sched());
        }
    }

    /// Whether `ctx` may be picked on this CPU. A context homed on an offline
    /// CPU is adopted.
    fn runs_here(&self, ctx: &Context) -> bool {
        if !ctx.is_ready() {
            return false;
        }
        let home = ctx.home_cpu();
        if home == self.cpu {
            return true;
        }
        if !self.machine.is_online(home) && self.machine.route(home) == self.cpu {
            debug!("CPU {}: adopting {:?} from offline CPU {}", self.cpu, ctx, home);
            ctx.set_home_cpu(self.cpu);
            return true;
        }
        false
    }

    /// Picks the head of the ready list and switches to it.
    pub fn schedule(&mut self) {
        let current = self.current.clone();
        current.set_helper(HelpingMode::NotHelping, &current);
        self.update_ready_list();

        let mut skipped: Vec<SchedContextRef> = Vec::new();
        loop {
            let sc = self.rq.next_to_run().unwrap_or_else(|| self.idle.sched().clone());
            let next = match sc.owner::<Context>() {
                Some(next) => next,
                None => {
                    error!("CPU {}: {:?} has no owner left, dropping it", self.cpu, sc);
                    self.rq.ready_dequeue(&sc);
                    continue;
                }
            };
            if !sc.is_idle() && !self.runs_here(&next) {
                self.rq.ready_dequeue(&sc);
                continue;
            }
            match self.schedule_switch_to_locked(&next) {
                Switch::Ok => break,
                Switch::Resched => continue,
                Switch::Failed if sc.is_idle() => break,
                Switch::Failed => {
                    // still executing on its previous CPU
                    self.rq.ready_dequeue(&sc);
                    skipped.push(sc);
                }
            }
        }

        if !skipped.is_empty() {
            for sc in skipped.iter() {
                self.rq.ready_enqueue(sc);
            }
            self.need_resched = true;
        }
    }

    /// Makes `next`'s timeslice current and switches to it.
    pub fn schedule_switch_to_locked(&mut self, next: &ContextRef) -> Switch {
        let sc = next.sched().clone();
        if !ready_queue::same_opt(self.rq.current_sched(), Some(&sc)) {
            self.set_current_sched(&sc);
        }
        if !context::same(&self.current, next) {
            self.switch_exec_locked(next, HelpingMode::NotHelping)
        } else {
            self.switch_handle_drq()
        }
    }

    /// Ends the current timeslice and starts `sc`'s.
    ///
    /// The old timeslice keeps the time it has left, or gets a fresh quantum
    /// if it has used it up.
    pub fn set_current_sched(&mut self, sc: &SchedContextRef) {
        let clock = self.clock();
        if let Some(cs) = self.rq.current_sched().cloned() {
            let left = self.timeslice.timeout_state().remaining(clock);
            if self.timeslice.timeout_state().is_set() && left > 0 {
                cs.set_left(left as u64);
            } else {
                cs.replenish();
            }
        }
        self.timeouts.reset(&*self.timeslice);
        let timeslice: TimeoutRef = self.timeslice.clone();
        self.timeouts.set(timeslice, clock + sc.left());
        trace!("CPU {}: timeslice of {:?} ends at {}", self.cpu, sc, clock + sc.left());
        self.rq.activate(sc.clone());
        self.update_timer();
    }

    /// Switches the CPU to `to` without a scheduling decision.
    ///
    /// With [`HelpingMode::Helping`], `to` runs on the current timeslice on
    /// behalf of the current context.
    pub fn switch_exec_locked(&mut self, to: &ContextRef, mode: HelpingMode) -> Switch {
        if context::same(&self.current, to) {
            return Switch::Ok;
        }
        if to.is_running() {
            if to.home_cpu() == self.cpu && to.is_ready() {
                self.rq.ready_enqueue(to.sched());
            }
            return Switch::Failed;
        }
        if !to.is_ready() {
            return Switch::Failed;
        }

        let from = self.current.clone();
        if to.home_cpu() == self.cpu {
            to.set_helper(mode, &from);
        }
        self.update_ready_list();
        if FINE_GRAINED_CPUTIME {
            from.consume_time(self.clock.delta_us());
        }

        trace!("CPU {}: switch {:?} -> {:?} ({:?})", self.cpu, from, to, mode);
        self.arch.switch_cpu(&from, to);
        from.set_running(false);
        to.set_running(true);
        self.current = to.clone();

        self.switch_handle_drq()
    }

    /// Like [`switch_exec_locked()`](Self::switch_exec_locked), followed by a
    /// full scheduling decision if the switch did not settle things.
    pub fn switch_exec_schedule_locked(&mut self, to: &ContextRef, mode: HelpingMode) {
        if self.switch_exec_locked(to, mode) != Switch::Ok {
            self.schedule();
        }
    }

    pub(crate) fn switch_handle_drq(&mut self) -> Switch {
        if self.handle_drq() {
            Switch::Resched
        } else {
            Switch::Ok
        }
    }

    /// Switches to `to`, falling back to a scheduling decision if that fails.
    pub fn switch_to_locked(&mut self, to: &ContextRef) {
        if self.schedule_switch_to_locked(to) != Switch::Ok {
            self.schedule();
        }
    }

    /// Puts a ready `ctx` on the ready list. Returns whether it should preempt
    /// the current context.
    ///
    /// With `lazy` and a positive answer, `ctx` is not enqueued: the caller
    /// is expected to switch to it.
    pub fn deblock(&mut self, ctx: &Context, lazy: bool) -> bool {
        assert_eq!(ctx.home_cpu(), self.cpu, "CpuSched::deblock(): context is homed on another CPU");
        self.rq.deblock(ctx.sched(), Some(self.current.sched()), lazy)
    }

    /// Deblocks `ctx` and switches to it right away if it should preempt.
    pub fn deblock_and_schedule(&mut self, ctx: &ContextRef) {
        if self.deblock(ctx, true) {
            self.switch_to_locked(ctx);
        }
    }

    /// Makes `ctx` ready, switching to it if it should preempt.
    /// Returns whether it switched.
    ///
    /// A context homed on another CPU is woken through that CPU's inbox.
    pub fn activate(&mut self, ctx: &ContextRef) -> bool {
        if ctx.home_cpu() != self.cpu {
            self.xcpu_state_change(ctx, ThreadState::empty(), ThreadState::READY, false);
            return false;
        }
        ctx.state_add_dirty(ThreadState::READY);
        if self.deblock(ctx, true) {
            self.switch_to_locked(ctx);
            true
        } else {
            false
        }
    }

    /// Blocks the current context and picks another one.
    pub fn block_current(&mut self) {
        self.current.state_del_dirty(ThreadState::READY);
        self.schedule();
    }

    /// Schedules if a reschedule was requested. Returns whether it did.
    pub fn preemption_point(&mut self) -> bool {
        if self.handle_drq() {
            self.schedule();
            true
        } else {
            false
        }
    }

    // timeouts

    /// Arms `to` on behalf of `ctx` at the absolute time `wakeup`, replacing
    /// whatever `ctx` had armed before.
    pub fn set_timeout(&mut self, ctx: &Context, to: TimeoutRef, wakeup: u64) {
        self.reset_timeout(ctx);
        self.timeouts.set(to.clone(), wakeup);
        ctx.set_timeout(to);
        self.update_timer();
    }

    /// Disarms the timeout of `ctx`. Returns whether one was armed.
    pub fn reset_timeout(&mut self, ctx: &Context) -> bool {
        match ctx.take_timeout() {
            Some(to) => self.timeouts.reset(&*to),
            None => false,
        }
    }

    /// Fires every timeout that is due. Returns whether one asked for a reschedule.
    pub fn do_timeouts(&mut self) -> bool {
        let mut cx = ExpiryContext {
            rq: &mut self.rq,
            running: Some(self.current.sched().clone()),
            clock: self.machine.clock(),
        };
        self.timeouts.do_timeouts(&mut cx)
    }

    /// The time a one-shot timer would have to be programmed for.
    pub fn next_timer(&self) -> u64 {
        self.timeouts.next_wakeup()
    }

    /// Programs the one-shot timer for the earliest armed timeout, at least
    /// one granularity and at most [`ONE_SHOT_MAX_IDLE_US`] ahead of the clock.
    pub(crate) fn update_timer(&mut self) {
        if !self.one_shot {
            return;
        }
        let clock = self.clock();
        let next = self.timeouts
            .first_wakeup()
            .map_or(clock + ONE_SHOT_MAX_IDLE_US, |w| w.min(clock + ONE_SHOT_MAX_IDLE_US))
            .max(clock + SCHEDULER_GRANULARITY_US);
        if next != self.programmed {
            trace!("CPU {}: one-shot timer programmed for {}", self.cpu, next);
            self.programmed = next;
        }
    }

    /// The deadline the timer of this CPU is programmed for, or `None` if it
    /// ticks periodically.
    pub fn programmed_timer(&self) -> Option<u64> {
        if self.one_shot {
            Some(self.programmed)
        } else {
            None
        }
    }

    /// The timer interrupt of this CPU. Returns whether it rescheduled.
    pub fn timer_tick(&mut self) -> bool {
        self.ticks += 1;
        let one_shot = self.one_shot;
        // a one-shot interrupt arrives at the programmed deadline
        let now = if one_shot {
            self.programmed.max(self.clock())
        } else {
            self.ticks * SCHEDULER_GRANULARITY_US
        };
        let kip = self.machine.kip();
        match self.machine.tick_mode() {
            TimerTickMode::AnyCpu => {
                kip.advance_clock_to(now);
            }
            TimerTickMode::SysCpu if self.cpu == CpuId::BOOT => {
                if one_shot {
                    kip.advance_clock_to(now);
                } else {
                    kip.advance_clock(SCHEDULER_GRANULARITY_US);
                }
            }
            _ => {}
        }

        let clock = self.clock();
        let used = if FINE_GRAINED_CPUTIME {
            self.clock.delta_us()
        } else if one_shot {
            clock.saturating_sub(self.last_tick)
        } else {
            SCHEDULER_GRANULARITY_US
        };
        self.last_tick = clock;
        self.current.consume_time(used);

        let mut resched = self.do_timeouts();
        resched |= self.handle_drq();
        if resched {
            self.schedule();
        }
        self.update_timer();
        resched
    }
}

impl core::fmt::Debug for CpuSched {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuSched")
            .field("cpu", &self.cpu)
            .field("current", &self.current)
            .field("ready", &self.rq.len())
            .field("timeouts", &self.timeouts.len())
            .finish_non_exhaustive()
    }
}
