extern crate std;

use self::std::vec::Vec;
use super::*;
use context::{Context, ContextRef, HostedArch, ThreadState};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_config::time::{FINE_GRAINED_CPUTIME, ONE_SHOT_MAX_IDLE_US, SCHEDULER_GRANULARITY_US};
use sched_context::SchedContext;
use time::SoftCounter;
use timeout::Timeout;

const CPU1: CpuId = CpuId::new(1);

fn setup(num_cpus: usize, mode: TimerTickMode) -> (Scheduler, Vec<HostedArch>) {
    let mut archs = Vec::new();
    let sched = Scheduler::new(num_cpus, Arc::new(Kip::new(0, 0)), mode, Arc::new(SoftCounter::new()), |_| {
        let arch = HostedArch::new();
        archs.push(arch.clone());
        Box::new(arch)
    })
    .unwrap();
    // tests tick periodically unless they ask for one-shot mode
    for cpu in 0..num_cpus {
        sched.cpu(CpuId::new(cpu as u32)).one_shot = false;
    }
    (sched, archs)
}

fn thread(name: &str, cpu: CpuId, prio: u8, quantum: u64) -> ContextRef {
    Context::new(name, cpu, SchedContext::new(prio, quantum), None, None).unwrap()
}

#[test]
fn cpus_start_idle() {
    let (s, archs) = setup(2, TimerTickMode::SysCpu);
    assert_eq!(s.num_cpus(), 2);
    assert_eq!(s.machine().online().count(), 2);
    for i in 0..2 {
        let cs = s.cpu(CpuId::new(i));
        assert!(context::same(cs.current(), cs.idle()));
        assert!(cs.idle().is_running());
        assert_eq!(cs.idle().name(), std::format!("idle_cpu_{}", i));
    }
    assert!(archs.iter().all(|a| a.count() == 0));
    assert!(Scheduler::new(0, Arc::new(Kip::new(0, 0)), TimerTickMode::SysCpu, Arc::new(SoftCounter::new()), |_| {
        Box::new(HostedArch::new())
    })
    .is_err());
}

#[test]
fn fifo_within_priority_then_lower_priority() {
    let (s, archs) = setup(1, TimerTickMode::SysCpu);
    let mut cs = s.cpu(CpuId::BOOT);
    let a = thread("a", CpuId::BOOT, 10, 0);
    let b = thread("b", CpuId::BOOT, 10, 0);
    let c = thread("c", CpuId::BOOT, 5, 0);

    assert!(cs.activate(&a));
    assert!(!cs.activate(&b));
    assert!(!cs.activate(&c));
    assert!(context::same(cs.current(), &a));
    assert_eq!(cs.rq().len(), 2);

    cs.block_current();
    assert!(context::same(cs.current(), &b));
    cs.block_current();
    assert!(context::same(cs.current(), &c));
    cs.block_current();
    assert!(context::same(cs.current(), cs.idle()));
    assert!(cs.rq().is_empty());

    let idle_id = cs.idle().id();
    let order: Vec<usize> = archs[0].switches().iter().map(|r| r.to).collect();
    assert_eq!(order, [a.id(), b.id(), c.id(), idle_id]);
    assert!(!a.is_running() && !b.is_running() && !c.is_running());
}

#[test]
fn higher_priority_preempts_on_deblock() {
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    let mut cs = s.cpu(CpuId::BOOT);
    let low = thread("low", CpuId::BOOT, 10, 0);
    let high = thread("high", CpuId::BOOT, 20, 0);
    cs.activate(&low);

    high.state_add_dirty(ThreadState::READY);
    assert!(cs.deblock(&high, false));
    assert!(high.sched().in_ready_list());
    cs.schedule();
    assert!(context::same(cs.current(), &high));
    // the preempted context is back on the ready list
    assert!(low.sched().in_ready_list());
}

#[test]
fn timeslice_expiry_round_robins() {
    let (s, archs) = setup(1, TimerTickMode::SysCpu);
    let a = thread("a", CpuId::BOOT, 10, 2 * SCHEDULER_GRANULARITY_US);
    let b = thread("b", CpuId::BOOT, 10, 2 * SCHEDULER_GRANULARITY_US);
    {
        let mut cs = s.cpu(CpuId::BOOT);
        cs.activate(&a);
        cs.activate(&b);
    }

    assert!(!s.timer_tick(CpuId::BOOT));
    assert!(s.timer_tick(CpuId::BOOT));
    assert!(context::same(s.cpu(CpuId::BOOT).current(), &b));
    assert_eq!(a.sched().left(), a.sched().quantum());

    s.timer_tick(CpuId::BOOT);
    s.timer_tick(CpuId::BOOT);
    assert!(context::same(s.cpu(CpuId::BOOT).current(), &a));
    assert_eq!(archs[0].count(), 3);
}

#[test]
fn armed_timeout_wakes_blocked_context() {
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    let t = thread("sleeper", CpuId::BOOT, 10, 0);
    t.state_add_dirty(ThreadState::RECEIVE_WAIT);
    {
        let mut cs = s.cpu(CpuId::BOOT);
        let wakeup = cs.clock() + 3 * SCHEDULER_GRANULARITY_US;
        cs.set_timeout(&t, t.ipc_timeout(), wakeup);
        assert!(t.has_armed_timeout());
    }

    s.timer_tick(CpuId::BOOT);
    s.timer_tick(CpuId::BOOT);
    assert!(!t.is_ready());
    assert!(s.timer_tick(CpuId::BOOT));
    assert!(t.state().contains(ThreadState::READY | ThreadState::TIMEOUT));
    assert!(t.timeout().is_none());
    assert!(context::same(s.cpu(CpuId::BOOT).current(), &t));
}

#[test]
fn reset_timeout_disarms() {
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    let mut cs = s.cpu(CpuId::BOOT);
    let t = thread("t", CpuId::BOOT, 10, 0);
    cs.set_timeout(&t, t.ipc_timeout(), 500);
    assert_eq!(cs.timeouts().len(), 2);
    assert!(cs.reset_timeout(&t));
    assert!(!cs.reset_timeout(&t));
    assert_eq!(cs.timeouts().len(), 1);
    assert!(!t.ipc_timeout().timeout_state().is_set());
}

#[test]
fn remote_wakeup_goes_through_the_inbox() {
    let (s, _) = setup(2, TimerTickMode::AnyCpu);
    let t = thread("remote", CPU1, 10, 0);

    assert!(!s.cpu(CpuId::BOOT).activate(&t));
    assert!(!t.is_ready());
    assert_eq!(s.machine().pending_drqs(CPU1), 1);
    assert_eq!(t.pending_drqs(), 1);

    assert!(s.timer_tick(CPU1));
    assert!(t.is_ready());
    assert_eq!(t.pending_drqs(), 0);
    assert!(context::same(s.cpu(CPU1).current(), &t));
    let cs0 = s.cpu(CpuId::BOOT);
    assert!(context::same(cs0.current(), cs0.idle()));
}

#[test]
fn migration_moves_context_and_timeout() {
    let (s, _) = setup(2, TimerTickMode::SysCpu);
    let running = thread("running", CpuId::BOOT, 5, 0);
    let ready = thread("ready", CpuId::BOOT, 5, 0);
    let blocked = thread("blocked", CpuId::BOOT, 5, 0);
    {
        let mut cs0 = s.cpu(CpuId::BOOT);
        cs0.activate(&running);
        cs0.activate(&ready);
        cs0.set_timeout(&blocked, blocked.ipc_timeout(), 5000);
        assert_eq!(cs0.timeouts().len(), 2);

        cs0.migrate(&ready, CPU1).unwrap();
        cs0.migrate(&blocked, CPU1).unwrap();
        assert!(cs0.rq().is_empty());
        assert_eq!(cs0.timeouts().len(), 1);
        assert_eq!(ready.home_cpu(), CPU1);
        assert!(ready.state().contains(ThreadState::FINISH_MIGRATION));
        assert!(cs0.migrate(&ready, CpuId::BOOT).is_err());

        // the running context leaves right away
        cs0.migrate(&running, CPU1).unwrap();
        assert!(context::same(cs0.current(), cs0.idle()));
        assert!(!running.is_running());
    }

    let mut cs1 = s.cpu(CPU1);
    assert!(cs1.handle_drq());
    assert!(!ready.state().contains(ThreadState::FINISH_MIGRATION));
    assert_eq!(cs1.timeouts().len(), 2);
    assert!(blocked.has_armed_timeout());
    assert_eq!(blocked.pending_drqs(), 0);

    cs1.schedule();
    assert!(context::same(cs1.current(), &ready));
    assert!(running.sched().in_ready_list());
}

#[test]
fn offline_cpu_hands_its_contexts_to_the_boot_cpu() {
    let (s, _) = setup(2, TimerTickMode::SysCpu);
    let t = thread("t", CPU1, 7, 0);
    let u = thread("u", CPU1, 3, 0);
    s.cpu(CPU1).activate(&t);
    assert!(context::same(s.cpu(CPU1).current(), &t));

    assert!(s.cpu_offline(CpuId::BOOT).is_err());
    s.cpu_offline(CPU1).unwrap();
    assert!(s.cpu_offline(CPU1).is_err());
    assert!(!s.machine().is_online(CPU1));
    {
        let cs1 = s.cpu(CPU1);
        assert!(context::same(cs1.current(), cs1.idle()));
    }
    assert_eq!(t.home_cpu(), CpuId::BOOT);

    // a wakeup for a context still homed on the offline CPU lands on the boot CPU
    s.cpu(CpuId::BOOT).activate(&u);
    assert_eq!(s.machine().route(CPU1), CpuId::BOOT);
    assert_eq!(s.machine().pending_drqs(CPU1), 0);

    let mut cs0 = s.cpu(CpuId::BOOT);
    assert!(cs0.handle_drq());
    assert_eq!(u.home_cpu(), CpuId::BOOT);
    cs0.schedule();
    assert!(context::same(cs0.current(), &t));
    assert!(u.sched().in_ready_list());
    drop(cs0);

    s.cpu_online(CPU1).unwrap();
    assert!(s.machine().is_online(CPU1));
    assert!(s.cpu_online(CpuId::new(5)).is_err());
}

#[test]
fn remote_call_runs_on_target() {
    let (s, _) = setup(2, TimerTickMode::SysCpu);
    let ran_on_1 = Arc::new(AtomicBool::new(false));
    let ran_on_0 = Arc::new(AtomicBool::new(false));

    let flag = ran_on_1.clone();
    s.cpu(CpuId::BOOT).remote_call(CPU1, move |cs| flag.store(cs.cpu() == CPU1, Ordering::SeqCst));
    assert!(!ran_on_1.load(Ordering::SeqCst));
    let flag = ran_on_0.clone();
    s.cpu(CpuId::BOOT).remote_call(CpuId::BOOT, move |cs| flag.store(cs.cpu() == CpuId::BOOT, Ordering::SeqCst));
    assert!(ran_on_0.load(Ordering::SeqCst));

    assert!(!s.cpu(CPU1).handle_drq());
    assert!(ran_on_1.load(Ordering::SeqCst));
}

#[test]
fn helping_runs_on_the_donated_timeslice() {
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    let mut cs = s.cpu(CpuId::BOOT);
    let caller = thread("caller", CpuId::BOOT, 10, 0);
    let callee = thread("callee", CpuId::BOOT, 3, 0);
    cs.activate(&caller);
    callee.state_add_dirty(ThreadState::READY);

    caller.state_del_dirty(ThreadState::READY);
    assert_eq!(cs.switch_exec_locked(&callee, HelpingMode::Helping), Switch::Ok);
    assert!(context::same(cs.current(), &callee));
    assert!(context::same(&callee.helper().unwrap(), &caller));
    assert!(ready_queue::same_opt(cs.rq().current_sched(), Some(caller.sched())));

    // a prio 8 wakeup beats the callee, but not the donated prio 10 timeslice
    let mid = thread("mid", CpuId::BOOT, 8, 0);
    mid.state_add_dirty(ThreadState::READY);
    assert!(!cs.deblock(&mid, false));
    let high = thread("high", CpuId::BOOT, 12, 0);
    high.state_add_dirty(ThreadState::READY);
    assert!(cs.deblock(&high, false));

    // donation ends at the next scheduling decision
    cs.schedule();
    assert!(context::same(cs.current(), &high));
    assert!(callee.helper().is_none());
}

#[test]
fn tick_modes_advance_the_clock() {
    let (s, _) = setup(2, TimerTickMode::SysCpu);
    s.timer_tick(CPU1);
    assert_eq!(s.machine().clock(), 0);
    s.timer_tick(CpuId::BOOT);
    assert_eq!(s.machine().clock(), SCHEDULER_GRANULARITY_US);

    let (s, _) = setup(2, TimerTickMode::AnyCpu);
    s.timer_tick(CPU1);
    s.timer_tick(CPU1);
    s.timer_tick(CpuId::BOOT);
    assert_eq!(s.machine().clock(), 2 * SCHEDULER_GRANULARITY_US);

    let (s, _) = setup(1, TimerTickMode::AppCpu);
    s.timer_tick(CpuId::BOOT);
    assert_eq!(s.machine().clock(), 0);
}

#[test]
fn one_shot_timer_follows_the_next_timeout() {
    if FINE_GRAINED_CPUTIME {
        return;
    }
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    let sleeper = thread("sleeper", CpuId::BOOT, 10, 0);
    sleeper.state_add_dirty(ThreadState::RECEIVE_WAIT);
    let a = thread("a", CpuId::BOOT, 5, 8 * SCHEDULER_GRANULARITY_US);
    let wakeup = 3 * SCHEDULER_GRANULARITY_US + 500;
    {
        let mut cs = s.cpu(CpuId::BOOT);
        cs.one_shot = true;
        cs.update_timer();
        cs.activate(&a);
        assert_eq!(cs.programmed_timer(), Some(8 * SCHEDULER_GRANULARITY_US));
        cs.set_timeout(&sleeper, sleeper.ipc_timeout(), wakeup);
        assert_eq!(cs.programmed_timer(), Some(wakeup));
    }

    // one interrupt, straight at the deadline
    assert!(s.timer_tick(CpuId::BOOT));
    assert_eq!(s.machine().clock(), wakeup);
    assert!(sleeper.state().contains(ThreadState::READY | ThreadState::TIMEOUT));
    assert_eq!(a.consumed_time(), wakeup);

    let cs = s.cpu(CpuId::BOOT);
    assert!(context::same(cs.current(), &sleeper));
    let next = cs.programmed_timer().unwrap();
    assert!(next > wakeup && next <= wakeup + ONE_SHOT_MAX_IDLE_US);
}

#[test]
fn periodic_timer_is_not_programmed() {
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    assert_eq!(s.cpu(CpuId::BOOT).programmed_timer(), None);
}

#[test]
fn ticks_charge_the_running_context() {
    if FINE_GRAINED_CPUTIME {
        return;
    }
    let (s, _) = setup(1, TimerTickMode::SysCpu);
    for _ in 0..3 {
        s.timer_tick(CpuId::BOOT);
    }
    assert_eq!(s.cpu(CpuId::BOOT).idle_time(), 3 * SCHEDULER_GRANULARITY_US);

    let t = thread("t", CpuId::BOOT, 10, 0);
    s.cpu(CpuId::BOOT).activate(&t);
    s.timer_tick(CpuId::BOOT);
    assert_eq!(t.consumed_time(), SCHEDULER_GRANULARITY_US);
}

#[test]
fn racing_cpus_deliver_every_wakeup() {
    let (s, _) = setup(2, TimerTickMode::AnyCpu);
    let s = Arc::new(s);
    let threads: Vec<ContextRef> = (0..32).map(|i| thread("w", CPU1, (i % 7 + 1) as u8, 0)).collect();

    let poster = {
        let s = s.clone();
        let threads = threads.clone();
        std::thread::spawn(move || {
            for t in threads.iter() {
                s.cpu(CpuId::BOOT).activate(t);
            }
        })
    };
    let handler = {
        let s = s.clone();
        std::thread::spawn(move || {
            for _ in 0..1000 {
                s.cpu(CPU1).handle_drq();
            }
        })
    };
    poster.join().unwrap();
    handler.join().unwrap();
    s.cpu(CPU1).handle_drq();

    assert!(threads.iter().all(|t| t.is_ready() && t.pending_drqs() == 0));
}
