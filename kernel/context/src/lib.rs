//! This crate contains the [`Context`], the kernel's representation of anything
//! that can be scheduled: user threads, kernel threads and the per-CPU idle contexts.
//!
//! A `Context` owns its kernel stack and its scheduling context, and carries the
//! state that the scheduler and the IPC path act on:
//! * the [`ThreadState`] flags, always modified atomically,
//! * the home CPU, i.e., the only CPU whose scheduler may queue or run it,
//! * its IPC roles: the list of senders waiting for it, the partner and caller
//!   of the current operation, and the [`IpcTimeout`] it arms while waiting.
//!
//! The crate also defines the seams to the architecture layer ([`ArchSwitch`],
//! [`MemSpace`]) and the per-CPU request inboxes ([`DrqInbox`]).

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;

#[cfg(test)]
mod test;

mod arch;
mod drq;
mod ipc_role;
mod ipc_timeout;
mod stack;
mod state;

pub use arch::{same_space, ArchSwitch, HostedArch, HostedSpace, MemSpace, SwitchRecord};
pub use drq::{Drq, DrqInbox, DrqRequest};
pub use ipc_role::{CheckSender, IpcPhase, IpcRole, IpcWait};
pub use ipc_timeout::IpcTimeout;
pub use stack::KernelStack;
pub use state::ThreadState;

use abi::{Rights, SyscallFrame, Utcb};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use cpu::CpuId;
use crossbeam_utils::atomic::AtomicCell;
use kernel_config::memory::CONTEXT_QUOTA_SIZE;
use queue::{Queue, QueueItem, Queued};
use ram_quota::{QuotaCharge, RamQuota};
use sched_context::{SchedContext, SchedContextRef};
use spin::{Mutex, MutexGuard};
use state::AtomicThreadState;
use timeout::{Timeout, TimeoutRef};

pub type ContextRef = Arc<Context>;

/// How a switch affects the helper of the context being switched to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelpingMode {
    /// The outgoing context donates its time: it becomes the helper.
    Helping,
    /// The target runs on its own behalf.
    NotHelping,
    /// Leave the helper as it is.
    IgnoreHelping,
}

/// Why a context cannot be destroyed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyError {
    /// It is executing on a CPU.
    Running,
    /// It waits in some receiver's sender list.
    InSenderList,
    /// Its scheduling context is on a ready queue.
    InReadyList,
    /// Its timeout is armed.
    TimeoutArmed,
    /// A DRQ naming it has not been handled yet.
    DrqPending,
    /// Other contexts wait in its own sender list.
    HasSenders,
}

impl fmt::Display for DestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DestroyError::Running => "context is running",
            DestroyError::InSenderList => "context is queued in a sender list",
            DestroyError::InReadyList => "context is in the ready list",
            DestroyError::TimeoutArmed => "context has an armed timeout",
            DestroyError::DrqPending => "context is the target of a pending DRQ",
            DestroyError::HasSenders => "context has queued senders",
        };
        f.write_str(s)
    }
}

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);


/// A schedulable execution context.
pub struct Context {
    id: usize,
    name: String,
    stack: KernelStack,
    state: AtomicThreadState,
    home_cpu: AtomicCell<CpuId>,
    /// Whether this context is executing on some CPU right now.
    running: AtomicBool,
    sched: SchedContextRef,
    /// Consumed CPU time in µs.
    consumed: AtomicU64,
    helper: Mutex<Option<Weak<Context>>>,
    space: Option<Arc<dyn MemSpace>>,
    frame: Mutex<SyscallFrame>,
    utcb: Mutex<Utcb>,
    ipc: Mutex<IpcRole>,
    sender_list: Queue<Context>,
    sender_item: QueueItem,
    /// The timeout currently armed on behalf of this context.
    timeout: Mutex<Option<TimeoutRef>>,
    ipc_timeout: Arc<IpcTimeout>,
    pending_drqs: AtomicUsize,
    quota: Option<QuotaCharge>,
}

impl Context {
    /// Creates a blocked context homed on `home_cpu` that runs on `sched`.
    ///
    /// The allocation is charged to `quota`, if given.
    pub fn new(
        name: &str,
        home_cpu: CpuId,
        sched: SchedContextRef,
        space: Option<Arc<dyn MemSpace>>,
        quota: Option<&Arc<RamQuota>>,
    ) -> Result<ContextRef, &'static str> {
        let quota = quota.map(|q| q.charge(CONTEXT_QUOTA_SIZE)).transpose()?;
        let stack = KernelStack::new()?;

        let ctx = Arc::new_cyclic(|weak: &Weak<Context>| {
            let owner: Weak<dyn Any + Send + Sync> = weak.clone();
            sched.set_owner(owner);
            Context {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: String::from(name),
                stack,
                state: AtomicThreadState::new(ThreadState::empty()),
                home_cpu: AtomicCell::new(home_cpu),
                running: AtomicBool::new(false),
                sched,
                consumed: AtomicU64::new(0),
                helper: Mutex::new(None),
                space,
                frame: Mutex::new(SyscallFrame::default()),
                utcb: Mutex::new(Utcb::new()),
                ipc: Mutex::new(IpcRole::default()),
                sender_list: Queue::new(),
                sender_item: QueueItem::new(),
                timeout: Mutex::new(None),
                ipc_timeout: Arc::new(IpcTimeout::new(weak.clone())),
                pending_drqs: AtomicUsize::new(0),
                quota,
            }
        });
        ctx.stack.set_owner(Arc::as_ptr(&ctx) as usize);
        debug!("created context {:?} on CPU {}", ctx, home_cpu);
        Ok(ctx)
    }

    /// Creates the idle context of `cpu`. It is always ready.
    pub fn new_idle(cpu: CpuId) -> Result<ContextRef, &'static str> {
        let name = alloc::format!("idle_cpu_{}", cpu);
        let ctx = Context::new(&name, cpu, SchedContext::new_idle(), None, None)?;
        ctx.state_add_dirty(ThreadState::READY);
        Ok(ctx)
    }

    /// Recovers the context that owns the kernel stack containing `addr`.
    ///
    /// # Safety
    /// `addr` must lie within the kernel stack of a live context.
    pub unsafe fn from_stack_addr(addr: usize) -> Option<ContextRef> {
        let owner = KernelStack::owner_of(addr) as *const Context;
        if owner.is_null() {
            return None;
        }
        Arc::increment_strong_count(owner);
        Some(Arc::from_raw(owner))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack(&self) -> &KernelStack {
        &self.stack
    }

    pub fn home_cpu(&self) -> CpuId {
        self.home_cpu.load()
    }

    /// Only the scheduler moves a context between CPUs.
    pub fn set_home_cpu(&self, cpu: CpuId) {
        self.home_cpu.store(cpu);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn sched(&self) -> &SchedContextRef {
        &self.sched
    }

    pub fn space(&self) -> Option<&dyn MemSpace> {
        self.space.as_deref()
    }

    pub fn quota(&self) -> Option<&QuotaCharge> {
        self.quota.as_ref()
    }

    // state

    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    pub fn state_add_dirty(&self, add: ThreadState) {
        self.state.add(add);
    }

    pub fn state_del_dirty(&self, del: ThreadState) {
        self.state.del(del);
    }

    /// Clears `del`, then sets `add`. Returns the previous state.
    pub fn state_change_dirty(&self, del: ThreadState, add: ThreadState) -> ThreadState {
        self.state.change(del, add)
    }

    /// Like [`state_change_dirty()`](Self::state_change_dirty), but fails without
    /// changing anything if a bit of `del` is already clear or a bit of `add` is already set.
    pub fn state_change_safely(&self, del: ThreadState, add: ThreadState) -> bool {
        self.state.change_safely(del, add)
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    // time

    /// Consumed CPU time in µs.
    pub fn consumed_time(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn consume_time(&self, us: u64) {
        self.consumed.fetch_add(us, Ordering::Relaxed);
    }

    /// The context donating its timeslice to this one, if any.
    pub fn helper(&self) -> Option<ContextRef> {
        self.helper.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_helper(&self, mode: HelpingMode, current: &ContextRef) {
        match mode {
            HelpingMode::Helping => *self.helper.lock() = Some(Arc::downgrade(current)),
            HelpingMode::NotHelping => *self.helper.lock() = None,
            HelpingMode::IgnoreHelping => {}
        }
    }

    // user-visible registers

    pub fn frame(&self) -> MutexGuard<'_, SyscallFrame> {
        self.frame.lock()
    }

    pub fn utcb(&self) -> MutexGuard<'_, Utcb> {
        self.utcb.lock()
    }

    // IPC roles

    pub fn ipc(&self) -> MutexGuard<'_, IpcRole> {
        self.ipc.lock()
    }

    /// The receive partner: the closed-wait sender or the sender an open wait picked.
    pub fn partner(&self) -> Option<ContextRef> {
        self.ipc.lock().partner.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_partner(&self, partner: Option<&ContextRef>) {
        self.ipc.lock().partner = partner.map(Arc::downgrade);
    }

    pub fn is_partner(&self, ctx: &Context) -> bool {
        self.ipc.lock().partner.as_ref().map_or(false, |p| core::ptr::eq(p.as_ptr(), ctx))
    }

    /// The reply capability.
    pub fn caller(&self) -> Option<(ContextRef, Rights)> {
        let ipc = self.ipc.lock();
        let (caller, rights) = ipc.caller.as_ref()?;
        caller.upgrade().map(|c| (c, *rights))
    }

    pub fn set_caller(&self, caller: &ContextRef, rights: Rights) {
        self.ipc.lock().caller = Some((Arc::downgrade(caller), rights));
    }

    pub fn reset_caller(&self) {
        self.ipc.lock().caller = None;
    }

    pub fn is_caller(&self, ctx: &Context) -> bool {
        self.ipc.lock().caller.as_ref().map_or(false, |(c, _)| core::ptr::eq(c.as_ptr(), ctx))
    }

    pub fn ipc_phase(&self) -> IpcPhase {
        self.ipc.lock().wait.phase
    }

    pub fn set_ipc_phase(&self, phase: IpcPhase) {
        self.ipc.lock().wait.phase = phase;
    }

    /// Whether an IPC operation has to be resumed before returning to user level.
    pub fn ipc_pending(&self) -> bool {
        self.ipc_phase() != IpcPhase::Idle
    }

    /// The contexts waiting to send to this one, highest priority first.
    pub fn sender_list(&self) -> &Queue<Context> {
        &self.sender_list
    }

    pub fn in_sender_list(&self) -> bool {
        self.sender_item.is_queued()
    }

    /// Whether `sender` is transferring a message to this context right now.
    pub fn in_ipc(&self, sender: &Context) -> bool {
        self.state().contains(ThreadState::RECEIVE_IN_PROGRESS) && self.is_partner(sender)
    }

    // timeouts

    /// The embedded IPC timeout, for arming it on a timeout queue.
    pub fn ipc_timeout(&self) -> TimeoutRef {
        self.ipc_timeout.clone()
    }

    /// The timeout currently armed on behalf of this context.
    pub fn timeout(&self) -> Option<TimeoutRef> {
        self.timeout.lock().clone()
    }

    pub fn set_timeout(&self, to: TimeoutRef) {
        *self.timeout.lock() = Some(to);
    }

    /// Forgets the armed timeout, returning it so that the caller can disarm it.
    pub fn take_timeout(&self) -> Option<TimeoutRef> {
        self.timeout.lock().take()
    }

    pub fn has_armed_timeout(&self) -> bool {
        self.timeout.lock().as_ref().map_or(false, |t| t.timeout_state().is_set())
            || self.ipc_timeout.timeout_state().is_set()
    }

    // DRQs

    pub fn drq_posted(&self) {
        self.pending_drqs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn drq_handled(&self) {
        let prev = self.pending_drqs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "Context::drq_handled(): no DRQ was pending");
    }

    pub fn pending_drqs(&self) -> usize {
        self.pending_drqs.load(Ordering::Acquire)
    }

    // lifecycle

    fn check_destroyable(&self) -> Result<(), DestroyError> {
        if self.is_running() {
            Err(DestroyError::Running)
        } else if self.in_sender_list() {
            Err(DestroyError::InSenderList)
        } else if self.sched.in_ready_list() {
            Err(DestroyError::InReadyList)
        } else if self.has_armed_timeout() {
            Err(DestroyError::TimeoutArmed)
        } else if self.pending_drqs() != 0 {
            Err(DestroyError::DrqPending)
        } else if !self.sender_list.is_empty() {
            Err(DestroyError::HasSenders)
        } else {
            Ok(())
        }
    }

    /// Marks this context dead, unless something still refers to it.
    ///
    /// The memory is released once the last `ContextRef` is dropped.
    pub fn destroy(&self) -> Result<(), DestroyError> {
        if let Err(e) = self.check_destroyable() {
            warn!("Context::destroy(): refusing to destroy {:?}: {}", self, e);
            return Err(e);
        }
        self.state_change_dirty(ThreadState::READY_MASK, ThreadState::DEAD);
        debug!("destroyed context {:?}", self);
        Ok(())
    }
}

impl Queued for Context {
    fn queue_item(&self) -> &QueueItem {
        &self.sender_item
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug_assert!(
            self.sender_list.is_empty(),
            "context {} dropped while senders are still queued on it",
            self.name
        );
        self.stack.set_owner(0);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{} state {} on CPU {}}}", self.id, self.name, self.state(), self.home_cpu())
    }
}

/// Whether `a` and `b` are the same context.
pub fn same(a: &Context, b: &Context) -> bool {
    core::ptr::eq(a, b)
}
