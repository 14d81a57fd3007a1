//! A counting semaphore whose waiters block in the kernel.

use crate::{invoke_helper, Invocation, Kobject, Reply};
use abi::{commit_result, label, ErrorCode, Utcb};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use context::{Context, ThreadState};
use ipc::IpcOutcome;
use kernel_config::memory::KOBJECT_QUOTA_SIZE;
use queue::Queue;
use ram_quota::{QuotaCharge, RamQuota};
use scheduler::CpuSched;

/// The semaphore operations, in the low half of the first message word.
const OP_DOWN: usize = 0;

/// A semaphore. Waiters queue by priority; the count only changes while the
/// wait queue is locked.
pub struct Semaphore {
    waiting: Arc<Queue<Context>>,
    count: AtomicUsize,
    _charge: QuotaCharge,
}

impl Semaphore {
    pub fn new(quota: &Arc<RamQuota>) -> Result<Arc<Semaphore>, ErrorCode> {
        let charge = quota.charge(KOBJECT_QUOTA_SIZE).map_err(|_| ErrorCode::ENomem)?;
        Ok(Arc::new(Semaphore {
            waiting: Arc::new(Queue::new()),
            count: AtomicUsize::new(0),
            _charge: charge,
        }))
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn waiters(&self) -> usize {
        self.waiting.len()
    }

    /// Wakes the highest-priority waiter, or counts up if nobody waits.
    /// Returns whether a waiter was woken.
    pub fn up(&self, cs: &mut CpuSched) -> bool {
        let woken = {
            let mut waiting = self.waiting.q_lock();
            let first = waiting.pop_front();
            if first.is_none() {
                self.count.fetch_add(1, Ordering::Relaxed);
            }
            first
        };
        match woken {
            Some(waiter) => {
                debug!("semaphore {:#x}: waking {:?}", self.waiting.id(), waiter);
                if cs.xcpu_state_change(&waiter, ThreadState::empty(), ThreadState::READY, false) {
                    cs.request_resched();
                }
                true
            }
            None => false,
        }
    }

    /// Takes one count, or blocks the invoker until [`up()`](Self::up) or the
    /// receive timeout of `inv`.
    fn sys_down(&self, cs: &mut CpuSched, inv: &Invocation<'_>) -> Reply {
        let waiting = self.waiting.q_lock();
        let count = self.count.load(Ordering::Relaxed);
        if count > 0 {
            self.count.store(count - 1, Ordering::Relaxed);
            return Reply::Tag(commit_result(0));
        }
        inv.caller.frame().set_tag(commit_result(0));
        Reply::Committed(ipc::wait_on_queue(cs, &self.waiting, waiting, inv.timeout.rcv))
    }

    fn kinvoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>, input: &Utcb) -> Reply {
        if inv.tag.words() < 1 {
            return Reply::Tag(ErrorCode::EInval.result());
        }
        if inv.tag.proto() != label::SEMAPHORE {
            return Reply::Tag(ErrorCode::EBadproto.result());
        }
        match input.values[0] & 0xffff {
            OP_DOWN => self.sys_down(cs, inv),
            _ => Reply::Tag(ErrorCode::ENosys.result()),
        }
    }
}

impl Kobject for Semaphore {
    fn kind(&self) -> &'static str {
        "semaphore"
    }

    fn invoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>) -> IpcOutcome {
        invoke_helper(cs, inv, |cs, input, _| self.kinvoke(cs, inv, input))
    }
}
