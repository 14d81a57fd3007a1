extern crate std;

use super::*;
use abi::{L4Error, L4Timeout, TagFlags};
use alloc::boxed::Box;
use context::HostedArch;
use cpu::CpuId;
use kip::Kip;
use sched_context::SchedContext;
use scheduler::{Scheduler, TimerTickMode};
use time::SoftCounter;

const CPU1: CpuId = CpuId::new(1);

fn setup(num_cpus: usize) -> Scheduler {
    Scheduler::new(num_cpus, Arc::new(Kip::new(0, 0)), TimerTickMode::SysCpu, Arc::new(SoftCounter::new()), |_| {
        Box::new(HostedArch::new())
    })
    .unwrap()
}

fn thread(name: &str, cpu: CpuId, prio: u8) -> ContextRef {
    Context::new(name, cpu, SchedContext::new(prio, 0), None, None).unwrap()
}

fn is_current(cs: &CpuSched, ctx: &Context) -> bool {
    context::same(cs.current(), ctx)
}

fn rcv_timeout(us: u64) -> TimeoutPair {
    TimeoutPair::new(L4Timeout::from_us(us), L4Timeout::NEVER)
}

fn snd_timeout(us: u64) -> TimeoutPair {
    TimeoutPair::new(L4Timeout::NEVER, L4Timeout::from_us(us))
}

#[test]
fn call_and_reply_switch_directly() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let server = thread("server", CpuId::BOOT, 10);
    let client = thread("client", CpuId::BOOT, 10);

    cs.activate(&server);
    assert_eq!(do_ipc(&mut cs, IpcRequest::wait()), IpcOutcome::Blocked);
    assert!(is_current(&cs, cs.idle()));
    assert_eq!(server.ipc_phase(), IpcPhase::ReceiveWait);

    cs.activate(&client);
    client.utcb().values[..2].copy_from_slice(&[7, 8]);
    let req = IpcRequest::call(&server, MsgTag::new(2, 0, TagFlags::empty(), 42))
        .with_label(0x10)
        .with_rights(Rights::CW);
    assert_eq!(do_ipc(&mut cs, req), IpcOutcome::Blocked);

    // the server runs on the client's timeslice
    assert!(is_current(&cs, &server));
    assert!(context::same(&server.helper().unwrap(), &client));
    assert!(cs.rq().current_sched().map_or(false, |sc| sched_context::same(sc, client.sched())));
    assert_eq!(client.ipc_phase(), IpcPhase::Receive);

    finish_ipc(&mut cs);
    assert!(!server.ipc_pending());
    {
        let frame = server.frame();
        assert_eq!(frame.tag().words(), 2);
        assert_eq!(frame.tag().proto(), 42);
        assert_eq!(frame.from(), 0x10);
    }
    assert_eq!(&server.utcb().values[..2], &[7, 8]);
    let (caller, rights) = server.caller().unwrap();
    assert!(context::same(&caller, &client));
    assert_eq!(rights, Rights::CW);

    server.utcb().values[0] = 99;
    assert_eq!(do_ipc(&mut cs, IpcRequest::send(&client, MsgTag::new(1, 0, TagFlags::empty(), 0))), IpcOutcome::Done);
    assert!(is_current(&cs, &client));
    finish_ipc(&mut cs);

    assert!(!client.ipc_pending());
    assert!(!client.state().intersects(ThreadState::FULL_IPC_MASK));
    assert!(!client.frame().tag().has_error());
    assert_eq!(client.frame().tag().words(), 1);
    assert_eq!(client.utcb().values[0], 99);
}

#[test]
fn schedule_flag_defers_to_the_scheduler() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let server = thread("server", CpuId::BOOT, 5);
    let client = thread("client", CpuId::BOOT, 20);

    cs.activate(&server);
    do_ipc(&mut cs, IpcRequest::wait());
    cs.activate(&client);

    let tag = MsgTag::new(0, 0, TagFlags::SCHEDULE, 1);
    assert_eq!(do_ipc(&mut cs, IpcRequest::call(&server, tag)), IpcOutcome::Blocked);
    // the client sleeps for the answer, then the server gets the CPU on its own
    assert_eq!(client.ipc_phase(), IpcPhase::ReceiveWait);
    assert!(is_current(&cs, &server));
    assert!(server.helper().is_none());
    finish_ipc(&mut cs);
    assert_eq!(server.frame().tag().proto(), 1);
}

#[test]
fn open_wait_takes_queued_senders_by_priority() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);
    let low = thread("low", CpuId::BOOT, 5);
    let high = thread("high", CpuId::BOOT, 20);

    cs.activate(&low);
    assert_eq!(do_ipc(&mut cs, IpcRequest::send(&r, MsgTag::new(0, 0, TagFlags::empty(), 1)).with_label(1)), IpcOutcome::Blocked);
    cs.activate(&high);
    assert_eq!(do_ipc(&mut cs, IpcRequest::send(&r, MsgTag::new(0, 0, TagFlags::empty(), 2)).with_label(2)), IpcOutcome::Blocked);
    assert_eq!(r.sender_list().len(), 2);
    assert!(low.state().contains(ThreadState::SEND_WAIT));

    cs.activate(&r);
    assert_eq!(do_ipc(&mut cs, IpcRequest::wait()), IpcOutcome::Done);
    assert_eq!(r.frame().from(), 2);
    // the woken sender outranks the receiver
    assert!(is_current(&cs, &high));
    finish_ipc(&mut cs);
    assert!(!high.state().intersects(ThreadState::FULL_IPC_MASK));
    assert!(!high.frame().tag().has_error());

    cs.block_current();
    assert!(is_current(&cs, &r));
    assert_eq!(do_ipc(&mut cs, IpcRequest::wait()), IpcOutcome::Done);
    assert_eq!(r.frame().from(), 1);
    assert!(r.sender_list().is_empty());
    assert!(is_current(&cs, &r));
    assert!(low.is_ready());
}

#[test]
fn closed_wait_ignores_other_senders() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);
    let a = thread("a", CpuId::BOOT, 10);
    let b = thread("b", CpuId::BOOT, 10);

    cs.activate(&r);
    assert_eq!(do_ipc(&mut cs, IpcRequest::receive(&a)), IpcOutcome::Blocked);

    cs.activate(&b);
    let zero = TimeoutPair::new(L4Timeout::NEVER, L4Timeout::ZERO);
    let req = IpcRequest::send(&r, MsgTag::new(0, 0, TagFlags::empty(), 0)).with_timeout(zero);
    assert_eq!(do_ipc(&mut cs, req), IpcOutcome::Done);
    assert!(b.frame().tag().has_error());
    assert_eq!(b.utcb().error, L4Error::Timeout);
    assert!(r.sender_list().is_empty());
    cs.block_current();

    cs.activate(&a);
    assert_eq!(do_ipc(&mut cs, IpcRequest::send(&r, MsgTag::new(0, 0, TagFlags::empty(), 0)).with_label(0xa)), IpcOutcome::Done);
    assert!(!a.frame().tag().has_error());
    cs.block_current();
    assert!(is_current(&cs, &r));
    finish_ipc(&mut cs);
    assert_eq!(r.frame().from(), 0xa);
    assert!(!r.frame().tag().has_error());
}

#[test]
fn send_timeout_dequeues_the_sender() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);
    let snd = thread("sender", CpuId::BOOT, 10);

    cs.activate(&snd);
    let req = IpcRequest::send(&r, MsgTag::new(0, 0, TagFlags::empty(), 0)).with_timeout(snd_timeout(100));
    assert_eq!(do_ipc(&mut cs, req), IpcOutcome::Blocked);
    assert!(r.sender_list().owns(&snd));

    s.machine().kip().advance_clock(100);
    assert!(cs.do_timeouts());
    cs.schedule();
    assert!(is_current(&cs, &snd));
    finish_ipc(&mut cs);

    assert!(snd.frame().tag().has_error());
    assert_eq!(snd.utcb().error, L4Error::Timeout);
    assert!(r.sender_list().is_empty());
    assert!(!snd.in_sender_list());
    assert!(!snd.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn receive_timeout_fires_after_100us() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);

    cs.activate(&r);
    assert_eq!(do_ipc(&mut cs, IpcRequest::wait().with_timeout(rcv_timeout(100))), IpcOutcome::Blocked);
    assert!(r.timeout().is_some());

    s.machine().kip().advance_clock(99);
    assert!(!cs.do_timeouts());
    assert!(!r.is_ready());

    s.machine().kip().advance_clock(1);
    assert!(cs.do_timeouts());
    assert!(r.state().contains(ThreadState::READY | ThreadState::TIMEOUT));
    cs.schedule();
    finish_ipc(&mut cs);

    assert!(r.frame().tag().has_error());
    assert_eq!(r.utcb().error, L4Error::RTimeout);
    assert!(r.timeout().is_none());
    assert!(!r.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn zero_receive_timeout_returns_at_once() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);
    cs.activate(&r);

    let zero = TimeoutPair::new(L4Timeout::ZERO, L4Timeout::NEVER);
    assert_eq!(do_ipc(&mut cs, IpcRequest::wait().with_timeout(zero)), IpcOutcome::Done);
    assert!(is_current(&cs, &r));
    assert_eq!(r.utcb().error, L4Error::RTimeout);
    assert!(r.is_ready());
    assert!(!r.ipc_pending());
}

#[test]
fn cancel_aborts_both_phases() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);
    let snd = thread("sender", CpuId::BOOT, 10);
    let waiter = thread("waiter", CpuId::BOOT, 10);
    assert!(!cancel(&mut cs, &snd));

    cs.activate(&snd);
    do_ipc(&mut cs, IpcRequest::send(&r, MsgTag::new(0, 0, TagFlags::empty(), 0)));
    cs.activate(&waiter);
    do_ipc(&mut cs, IpcRequest::wait());
    assert!(is_current(&cs, cs.idle()));

    assert!(cancel(&mut cs, &snd));
    assert!(cancel(&mut cs, &waiter));
    assert!(cs.need_resched());
    cs.schedule();

    assert!(is_current(&cs, &snd));
    finish_ipc(&mut cs);
    assert_eq!(snd.utcb().error, L4Error::Canceled);
    assert!(r.sender_list().is_empty());
    cs.block_current();

    assert!(is_current(&cs, &waiter));
    finish_ipc(&mut cs);
    assert_eq!(waiter.utcb().error, L4Error::RCanceled);
    assert!(waiter.frame().tag().has_error());
    assert!(!waiter.state().intersects(ThreadState::FULL_IPC_MASK));
}

#[test]
fn dying_receiver_fails_its_senders() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let r = thread("receiver", CpuId::BOOT, 10);
    let a = thread("a", CpuId::BOOT, 10);
    let b = thread("b", CpuId::BOOT, 10);

    for snd in [&a, &b] {
        cs.activate(snd);
        assert_eq!(do_ipc(&mut cs, IpcRequest::send(&r, MsgTag::default())), IpcOutcome::Blocked);
    }
    assert_eq!(r.destroy(), Err(context::DestroyError::HasSenders));
    assert_eq!(ipc_receiver_aborted(&mut cs, &r), 2);
    assert!(r.destroy().is_ok());

    cs.schedule();
    for _ in 0..2 {
        let snd = cs.current().clone();
        assert!(context::same(&snd, &a) || context::same(&snd, &b));
        finish_ipc(&mut cs);
        assert_eq!(snd.utcb().error, L4Error::NotExistent);
        assert!(snd.frame().tag().has_error());
        cs.block_current();
    }

    // sending to a dead context fails right away
    cs.activate(&a);
    assert_eq!(do_ipc(&mut cs, IpcRequest::send(&r, MsgTag::default())), IpcOutcome::Done);
    assert_eq!(a.utcb().error, L4Error::NotExistent);
}

#[test]
fn call_across_cpus() {
    let s = setup(2);
    let server = thread("server", CPU1, 10);
    let client = thread("client", CpuId::BOOT, 10);

    {
        let mut cs1 = s.cpu(CPU1);
        cs1.activate(&server);
        assert_eq!(do_ipc(&mut cs1, IpcRequest::wait()), IpcOutcome::Blocked);
    }
    {
        let mut cs0 = s.cpu(CpuId::BOOT);
        cs0.activate(&client);
        client.utcb().values[0] = 5;
        let req = IpcRequest::call(&server, MsgTag::new(1, 0, TagFlags::empty(), 3));
        assert_eq!(do_ipc(&mut cs0, req), IpcOutcome::Blocked);
        assert!(client.state().contains(ThreadState::DRQ_WAIT));
        assert!(is_current(&cs0, cs0.idle()));
    }
    assert_eq!(s.machine().pending_drqs(CPU1), 1);

    {
        let mut cs1 = s.cpu(CPU1);
        assert!(cs1.preemption_point());
        assert!(is_current(&cs1, &server));
        finish_ipc(&mut cs1);
        assert_eq!(server.utcb().values[0], 5);
        assert_eq!(server.frame().tag().proto(), 3);
        assert!(context::same(&server.caller().unwrap().0, &client));

        server.utcb().values[0] = 6;
        assert_eq!(do_ipc(&mut cs1, IpcRequest::send(&client, MsgTag::new(1, 0, TagFlags::empty(), 0))), IpcOutcome::Blocked);
    }
    {
        let mut cs0 = s.cpu(CpuId::BOOT);
        assert!(cs0.preemption_point());
        assert!(is_current(&cs0, &client));
        finish_ipc(&mut cs0);
        assert!(!client.frame().tag().has_error());
        assert_eq!(client.utcb().values[0], 6);
        assert!(!client.state().intersects(ThreadState::FULL_IPC_MASK | ThreadState::DRQ_WAIT));
    }
    {
        let mut cs1 = s.cpu(CPU1);
        assert!(cs1.preemption_point());
        assert!(is_current(&cs1, &server));
        finish_ipc(&mut cs1);
        assert!(!server.frame().tag().has_error());
        assert!(!server.ipc_pending());
    }
}

#[test]
fn queue_wait_times_out_or_gets_woken() {
    let s = setup(1);
    let mut cs = s.cpu(CpuId::BOOT);
    let queue: Arc<queue::Queue<Context>> = Arc::new(queue::Queue::new());
    let t = thread("t", CpuId::BOOT, 10);
    cs.activate(&t);

    t.frame().set_tag(abi::commit_result(0));
    assert_eq!(wait_on_queue(&mut cs, &queue, queue.q_lock(), L4Timeout::from_us(50)), IpcOutcome::Blocked);
    assert!(queue.owns(&t));
    // a waiter does not accept messages
    assert!(!sender_ok(&t, cs.idle()));

    s.machine().kip().advance_clock(50);
    cs.do_timeouts();
    cs.schedule();
    finish_ipc(&mut cs);
    assert_eq!(t.utcb().error, L4Error::RTimeout);
    assert!(queue.is_empty());

    t.frame().set_tag(abi::commit_result(0));
    assert_eq!(wait_on_queue(&mut cs, &queue, queue.q_lock(), L4Timeout::NEVER), IpcOutcome::Blocked);
    let woken = queue.q_lock().pop_front().unwrap();
    cs.xcpu_state_change(&woken, ThreadState::empty(), ThreadState::READY, false);
    cs.schedule();
    finish_ipc(&mut cs);
    assert!(!t.frame().tag().has_error());
    assert!(!t.state().intersects(ThreadState::FULL_IPC_MASK));
    assert!(t.partner().is_none());
}

#[test]
fn remote_call_blocks_until_answered() {
    let s = setup(2);
    let t = thread("t", CpuId::BOOT, 10);
    {
        let mut cs0 = s.cpu(CpuId::BOOT);
        cs0.activate(&t);
        let outcome = call_remote(&mut cs0, CPU1, |remote, waiter| {
            waiter.utcb().values[0] = remote.cpu().value() as abi::Mword;
        });
        assert_eq!(outcome, IpcOutcome::Blocked);
        assert_eq!(t.ipc_phase(), IpcPhase::RemoteCall);
    }
    s.cpu(CPU1).handle_drq();
    {
        let mut cs0 = s.cpu(CpuId::BOOT);
        assert!(cs0.preemption_point());
        assert!(is_current(&cs0, &t));
        finish_ipc(&mut cs0);
        assert_eq!(t.utcb().values[0], 1);
        assert!(!t.ipc_pending());
    }
}
