//! The scheduler: one [`CpuSched`] per CPU, bundled into a [`Scheduler`].
//!
//! There are no per-CPU globals. Entering the kernel on CPU *n* means locking
//! CPU *n*'s `CpuSched` through [`Scheduler::cpu()`], and every operation that
//! may pick a new context to run takes that `CpuSched` explicitly.
//!
//! A CPU never locks another CPU's `CpuSched`. Whatever it wants done there
//! (waking a context, finishing a migration, running a closure) is posted to
//! the target's DRQ inbox, which lives in the shared [`Machine`] and which
//! the target drains at its next switch, tick or [`CpuSched::handle_drq()`].

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
mod test;

mod cpu_sched;
mod migration;
mod remote;

pub use cpu_sched::{CpuSched, Switch};
pub use context::HelpingMode;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use context::{ArchSwitch, Drq, DrqInbox, DrqRequest};
use cpu::{AtomicCpuMask, CpuId, CpuMask};
use kernel_config::sched::MAX_CPUS;
use kip::Kip;
use spin::{Mutex, MutexGuard};
use time::ClockSource;

/// Which timer ticks advance the system clock in the KIP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerTickMode {
    /// Every CPU's tick moves the clock to its own tick count, so the clock
    /// follows the CPU that is furthest ahead.
    AnyCpu,
    /// Only the boot CPU's tick advances the clock.
    SysCpu,
    /// No tick advances the clock; ticks only process local timeouts.
    AppCpu,
}

/// The state shared by all CPUs.
pub struct Machine {
    kip: Arc<Kip>,
    tick_mode: TimerTickMode,
    inboxes: Vec<DrqInbox<CpuSched>>,
    present: CpuMask,
    online: AtomicCpuMask,
}

impl Machine {
    fn new(num_cpus: usize, kip: Arc<Kip>, tick_mode: TimerTickMode) -> Machine {
        let present = CpuMask::first_n(num_cpus);
        Machine {
            kip,
            tick_mode,
            inboxes: (0..num_cpus).map(|_| DrqInbox::new()).collect(),
            present,
            online: AtomicCpuMask::new(present),
        }
    }

    pub fn kip(&self) -> &Arc<Kip> {
        &self.kip
    }

    /// The system clock in µs.
    pub fn clock(&self) -> u64 {
        self.kip.clock()
    }

    pub fn tick_mode(&self) -> TimerTickMode {
        self.tick_mode
    }

    pub fn num_cpus(&self) -> usize {
        self.inboxes.len()
    }

    pub fn present(&self) -> CpuMask {
        self.present
    }

    pub fn online(&self) -> CpuMask {
        self.online.load()
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online.contains(cpu)
    }

    /// The CPU that handles requests meant for `cpu`: `cpu` itself while it
    /// is online, otherwise the boot CPU.
    pub fn route(&self, cpu: CpuId) -> CpuId {
        if self.is_online(cpu) { cpu } else { CpuId::BOOT }
    }

    pub(crate) fn inbox(&self, cpu: CpuId) -> &DrqInbox<CpuSched> {
        &self.inboxes[cpu.index()]
    }

    /// Posts `request` to the inbox of `target` (or of the boot CPU, if
    /// `target` is offline). Returns the CPU it was posted to.
    pub fn post(&self, target: CpuId, request: DrqRequest<CpuSched>) -> CpuId {
        let to = self.route(target);
        if to != target {
            debug!("DRQ for offline CPU {} redirected to CPU {}: {:?}", target, to, request);
        } else {
            trace!("posting DRQ to CPU {}: {:?}", to, request);
        }
        self.inbox(to).q_lock().enqueue(Drq::new(request));
        to
    }

    /// The number of requests waiting in the inbox of `cpu`.
    pub fn pending_drqs(&self, cpu: CpuId) -> usize {
        self.inbox(cpu).len()
    }
}


/// All CPUs' schedulers.
pub struct Scheduler {
    machine: Arc<Machine>,
    cpus: Vec<Mutex<CpuSched>>,
}

impl Scheduler {
    /// Creates the schedulers of `num_cpus` CPUs, all of them online and running
    /// their idle context.
    ///
    /// `arch` is asked once per CPU for the switch layer of that CPU.
    /// All CPUs read time from `clock_source`, calibrated from the KIP.
    pub fn new(
        num_cpus: usize,
        kip: Arc<Kip>,
        tick_mode: TimerTickMode,
        clock_source: Arc<dyn ClockSource>,
        mut arch: impl FnMut(CpuId) -> Box<dyn ArchSwitch>,
    ) -> Result<Scheduler, &'static str> {
        if num_cpus == 0 || num_cpus > MAX_CPUS {
            return Err("unsupported number of CPUs");
        }
        let machine = Arc::new(Machine::new(num_cpus, kip, tick_mode));
        let mut cpus = Vec::with_capacity(num_cpus);
        for i in 0..num_cpus {
            let cpu = CpuId::new(i as u32);
            let cs = CpuSched::new(cpu, machine.clone(), arch(cpu), clock_source.clone())?;
            cpus.push(Mutex::new(cs));
        }
        info!("scheduler: {} CPUs, tick mode {:?}", num_cpus, tick_mode);
        Ok(Scheduler { machine, cpus })
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Enters the kernel on `cpu`.
    ///
    /// # Panics
    /// If `cpu` does not exist.
    pub fn cpu(&self, cpu: CpuId) -> MutexGuard<'_, CpuSched> {
        self.cpus[cpu.index()].lock()
    }

    /// The timer interrupt handler of `cpu`. Returns whether it rescheduled.
    pub fn timer_tick(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).timer_tick()
    }

    /// Brings `cpu` (back) online.
    pub fn cpu_online(&self, cpu: CpuId) -> Result<(), &'static str> {
        if !self.machine.present.contains(cpu) {
            return Err("no such CPU");
        }
        if self.machine.online.insert(cpu) {
            info!("CPU {} is online", cpu);
        }
        Ok(())
    }

    /// Takes `cpu` offline and moves everything homed there to the boot CPU.
    ///
    /// Requests posted for `cpu` from now on go to the boot CPU instead.
    pub fn cpu_offline(&self, cpu: CpuId) -> Result<(), &'static str> {
        if cpu == CpuId::BOOT {
            return Err("the boot CPU cannot go offline");
        }
        if !self.machine.present.contains(cpu) {
            return Err("no such CPU");
        }
        if !self.machine.online.remove(cpu) {
            return Err("CPU is already offline");
        }
        let moved = self.cpu(cpu).evacuate();
        info!("CPU {} is offline, moved {} contexts to CPU {}", cpu, moved, CpuId::BOOT);
        Ok(())
    }
}
