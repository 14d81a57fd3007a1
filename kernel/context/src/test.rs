extern crate std;

use self::std::vec::Vec;
use super::*;
use queue::QueueStatus;
use ready_queue::ReadyQueue;
use timeout::{ExpiryContext, TimeoutQueue};

fn ctx(name: &str, prio: u8) -> ContextRef {
    Context::new(name, CpuId::new(0), SchedContext::new(prio, 0), None, None).unwrap()
}

#[test]
fn state_masks() {
    assert_eq!(ThreadState::READY_MASK.bits(), 0x3);
    assert_eq!(ThreadState::IPC_MASK.bits(), 0x1c);
    assert_eq!(ThreadState::FULL_IPC_MASK.bits(), 0x1fc);
    assert_eq!(ThreadState::IPC_ABORT_MASK.bits(), 0x1e0);
    assert_eq!(ThreadState::CANCELED, ThreadState::TRANSFER_FAILED);
}

#[test]
fn state_change_safely_rejects_stale_expectations() {
    let c = ctx("c", 1);
    c.state_add_dirty(ThreadState::RECEIVE_WAIT);

    // RECEIVE_WAIT -> IPC_TRANSFER succeeds once
    assert!(c.state_change_safely(ThreadState::RECEIVE_WAIT, ThreadState::IPC_TRANSFER));
    assert!(!c.state_change_safely(ThreadState::RECEIVE_WAIT, ThreadState::IPC_TRANSFER));
    assert_eq!(c.state(), ThreadState::IPC_TRANSFER);

    c.state_change_dirty(ThreadState::IPC_TRANSFER, ThreadState::READY);
    assert_eq!(c.state(), ThreadState::READY);
}

#[test]
fn owner_from_stack_address() {
    let c = ctx("stacked", 1);
    let addr = c.stack().bottom() + 4321;
    let found = unsafe { Context::from_stack_addr(addr) }.unwrap();
    assert!(Arc::ptr_eq(&found, &c));
    assert_eq!(c.stack().top() - c.stack().bottom(), kernel_config::memory::KERNEL_STACK_SIZE);
}

#[test]
fn sched_context_knows_its_owner() {
    let c = ctx("owned", 7);
    let owner = c.sched().owner::<Context>().unwrap();
    assert!(Arc::ptr_eq(&owner, &c));
}

#[test]
fn ipc_timeout_is_noop_on_ready_owner() {
    let c = ctx("ready", 20);
    c.state_add_dirty(ThreadState::READY | ThreadState::RECEIVE_WAIT);
    let mut rq = ReadyQueue::new();
    let mut cx = ExpiryContext { rq: &mut rq, running: None, clock: 0 };
    assert!(!c.ipc_timeout().expired(&mut cx));
    assert_eq!(c.state(), ThreadState::READY | ThreadState::RECEIVE_WAIT);
    assert!(rq.is_empty());
}

#[test]
fn ipc_timeout_is_noop_while_receive_in_progress() {
    let c = ctx("busy", 20);
    c.state_add_dirty(ThreadState::RECEIVE_IN_PROGRESS);
    let mut rq = ReadyQueue::new();
    let mut cx = ExpiryContext { rq: &mut rq, running: None, clock: 0 };
    assert!(!c.ipc_timeout().expired(&mut cx));
    assert!(!c.state().contains(ThreadState::TIMEOUT));
}

#[test]
fn ipc_timeout_wakes_blocked_owner() {
    let high = ctx("high", 20);
    let low = ctx("low", 5);
    high.state_add_dirty(ThreadState::RECEIVE_WAIT);
    low.state_add_dirty(ThreadState::RECEIVE_WAIT);

    let running = SchedContext::new(10, 0);
    let mut rq = ReadyQueue::new();
    rq.activate(running.clone());

    let mut cx = ExpiryContext { rq: &mut rq, running: Some(running.clone()), clock: 50 };
    assert!(high.ipc_timeout().expired(&mut cx));
    assert!(!low.ipc_timeout().expired(&mut cx));

    for c in [&high, &low] {
        assert!(c.state().contains(ThreadState::READY | ThreadState::TIMEOUT));
        assert!(c.sched().in_ready_list());
    }
    // a second expiry finds the owner ready
    let mut cx = ExpiryContext { rq: &mut rq, running: Some(running), clock: 60 };
    assert!(!high.ipc_timeout().expired(&mut cx));
}

#[test]
fn receive_timeout_fires_exactly_once() {
    let c = ctx("receiver", 1);
    c.state_add_dirty(ThreadState::RECEIVE_WAIT);
    let mut tq = TimeoutQueue::new();
    let mut rq = ReadyQueue::new();

    c.set_timeout(c.ipc_timeout());
    tq.set(c.ipc_timeout(), 100);
    assert!(c.has_armed_timeout());

    let mut cx = ExpiryContext { rq: &mut rq, running: None, clock: 99 };
    tq.do_timeouts(&mut cx);
    assert!(!c.state().contains(ThreadState::READY));

    let mut cx = ExpiryContext { rq: &mut rq, running: None, clock: 100 };
    assert!(tq.do_timeouts(&mut cx));
    assert_eq!(c.state(), ThreadState::READY | ThreadState::TIMEOUT | ThreadState::RECEIVE_WAIT);
    assert!(c.timeout().is_none());
    assert!(!c.has_armed_timeout());

    let mut cx = ExpiryContext { rq: &mut rq, running: None, clock: 200 };
    assert!(!tq.do_timeouts(&mut cx));
    assert!(!c.ipc_timeout().expired(&mut cx));
    assert_eq!(rq.len(), 1);
}

#[test]
fn destroy_rejects_referenced_contexts() {
    let receiver = ctx("receiver", 1);
    let sender = ctx("sender", 1);

    receiver.sender_list().q_lock().enqueue_prio(sender.clone(), 1);
    assert_eq!(sender.destroy(), Err(DestroyError::InSenderList));
    assert_eq!(receiver.destroy(), Err(DestroyError::HasSenders));
    assert!(receiver.sender_list().dequeue(&sender, QueueStatus::Invalid));

    let mut tq = TimeoutQueue::new();
    tq.set(sender.ipc_timeout(), 1000);
    assert_eq!(sender.destroy(), Err(DestroyError::TimeoutArmed));
    assert!(tq.reset(&*sender.ipc_timeout()));

    sender.set_running(true);
    assert_eq!(sender.destroy(), Err(DestroyError::Running));
    sender.set_running(false);

    sender.drq_posted();
    assert_eq!(sender.destroy(), Err(DestroyError::DrqPending));
    sender.drq_handled();

    let mut rq = ReadyQueue::new();
    rq.ready_enqueue(sender.sched());
    assert_eq!(sender.destroy(), Err(DestroyError::InReadyList));
    rq.ready_dequeue(sender.sched());

    sender.state_add_dirty(ThreadState::READY);
    assert_eq!(sender.destroy(), Ok(()));
    assert_eq!(sender.state(), ThreadState::DEAD);
    assert_eq!(receiver.destroy(), Ok(()));
}

#[test]
fn quota_denial_fails_creation() {
    let quota = RamQuota::new_root(CONTEXT_QUOTA_SIZE + 10);
    let a = Context::new("a", CpuId::new(0), SchedContext::new(1, 0), None, Some(&quota)).unwrap();
    assert!(Context::new("b", CpuId::new(0), SchedContext::new(1, 0), None, Some(&quota)).is_err());
    drop(a);
    assert_eq!(quota.current(), 0);
    assert!(Context::new("c", CpuId::new(0), SchedContext::new(1, 0), None, Some(&quota)).is_ok());
}

#[test]
fn hosted_arch_switches_spaces_only_when_they_differ() {
    let space_a = HostedSpace::new();
    let space_b = HostedSpace::new();
    let mk = |name: &str, space: &Arc<HostedSpace>| {
        let space: Arc<dyn MemSpace> = space.clone();
        Context::new(name, CpuId::new(0), SchedContext::new(1, 0), Some(space), None).unwrap()
    };
    let a1 = mk("a1", &space_a);
    let a2 = mk("a2", &space_a);
    let b = mk("b", &space_b);

    let arch = HostedArch::new();
    let mut cpu_arch: alloc::boxed::Box<dyn ArchSwitch> = alloc::boxed::Box::new(arch.clone());
    cpu_arch.switch_cpu(&a1, &a2);
    cpu_arch.switch_cpu(&a2, &b);
    cpu_arch.switch_cpu(&b, &a1);

    let spaces: Vec<bool> = arch.switches().iter().map(|r| r.space_switch).collect();
    assert_eq!(spaces, [false, true, true]);
    assert_eq!(space_a.switchins(), 1);
    assert_eq!(space_b.switchins(), 1);
    assert_eq!(arch.last().map(|r| (r.from, r.to)), Some((b.id(), a1.id())));
}

#[test]
fn drq_is_taken_once_and_counted() {
    struct Cpu;
    let c = ctx("target", 1);
    let drq: Arc<Drq<Cpu>> = Drq::new(DrqRequest::StateChange {
        ctx: c.clone(),
        del: ThreadState::empty(),
        add: ThreadState::READY,
    });
    assert_eq!(c.pending_drqs(), 1);

    let inbox: DrqInbox<Cpu> = DrqInbox::new();
    inbox.q_lock().enqueue(drq.clone());
    let popped = inbox.q_lock().pop_front().unwrap();
    assert!(matches!(popped.take(), Some(DrqRequest::StateChange { .. })));
    assert!(popped.take().is_none());
    c.drq_handled();
    assert_eq!(c.pending_drqs(), 0);
}

#[test]
fn helper_follows_helping_mode() {
    let caller = ctx("caller", 1);
    let callee = ctx("callee", 1);
    callee.set_helper(HelpingMode::Helping, &caller);
    assert!(Arc::ptr_eq(&callee.helper().unwrap(), &caller));
    callee.set_helper(HelpingMode::IgnoreHelping, &callee);
    assert!(callee.helper().is_some());
    callee.set_helper(HelpingMode::NotHelping, &caller);
    assert!(callee.helper().is_none());
}
