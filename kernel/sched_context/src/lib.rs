//! A `SchedContext` is one schedulable timeslice.
//!
//! Every thread owns one, but the ready queue only ever deals with scheduling
//! contexts, never with threads directly. This lets a thread run on another
//! thread's timeslice (helping) and keeps the scheduler ignorant of the thread type:
//! the owner is reachable through a type-erased weak back-reference,
//! see [`SchedContext::owner()`].
//!
//! All fields are atomics, because a remote CPU may read the priority of a
//! context (e.g., to order a sender list) while its home CPU updates it.
//! Writes to the scheduling state itself only happen on the home CPU.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use abi::{ErrorCode, SchedParam};
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use kernel_config::sched::{IDLE_PRIO, MAX_PRIO};
use kernel_config::time::DEFAULT_TIME_SLICE_US;

pub type SchedContextRef = Arc<SchedContext>;

/// The scheduling class of a [`SchedContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedClass {
    FixedPrio = 0,
    Wfq = 1,
}

/// Why a set of scheduling parameters was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamError {
    /// A WFQ quantum or weight of zero.
    Inval,
    /// An unknown scheduling class.
    Range,
}

impl From<ParamError> for ErrorCode {
    fn from(e: ParamError) -> ErrorCode {
        match e {
            ParamError::Inval => ErrorCode::EInval,
            ParamError::Range => ErrorCode::ERange,
        }
    }
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

pub struct SchedContext {
    id: usize,
    class: AtomicU8,
    prio: AtomicU8,
    quantum: AtomicU64,
    left: AtomicU64,
    /// WFQ virtual deadline.
    deadline: AtomicU64,
    weight: AtomicU64,
    /// quantum / weight, the deadline advance per replenish.
    qdw: AtomicU64,
    in_ready_list: AtomicBool,
    idle: AtomicBool,
    owner: spin::Once<Weak<dyn Any + Send + Sync>>,
}

impl SchedContext {
    /// Creates a fixed-priority context with a full timeslice.
    pub fn new(prio: u8, quantum: u64) -> SchedContextRef {
        let quantum = if quantum == 0 { DEFAULT_TIME_SLICE_US } else { quantum };
        Arc::new(SchedContext {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            class: AtomicU8::new(SchedClass::FixedPrio as u8),
            prio: AtomicU8::new(prio),
            quantum: AtomicU64::new(quantum),
            left: AtomicU64::new(quantum),
            deadline: AtomicU64::new(0),
            weight: AtomicU64::new(1),
            qdw: AtomicU64::new(quantum),
            in_ready_list: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            owner: spin::Once::new(),
        })
    }

    /// Creates the context of a CPU's idle thread.
    pub fn new_idle() -> SchedContextRef {
        let sc = SchedContext::new(IDLE_PRIO, 0);
        sc.idle.store(true, Ordering::Relaxed);
        sc
    }

    /// Records the object this context belongs to. Only the first call has an effect.
    pub fn set_owner(&self, owner: Weak<dyn Any + Send + Sync>) {
        self.owner.call_once(|| owner);
    }

    /// Returns the owner, if it is still alive and of type `T`.
    pub fn owner<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.owner.get()?.upgrade()?.downcast::<T>().ok()
    }

    /// Rejects parameters [`set()`](Self::set) would not take.
    pub fn check(param: &SchedParam) -> Result<(), ParamError> {
        match *param {
            SchedParam::Wfq { quantum, weight } if quantum == 0 || weight == 0 => Err(ParamError::Inval),
            SchedParam::Unknown(_) => Err(ParamError::Range),
            _ => Ok(()),
        }
    }

    /// Applies new scheduling parameters. The remaining budget is not touched.
    pub fn set(&self, param: &SchedParam) -> Result<(), ParamError> {
        match *param {
            SchedParam::Legacy { prio, quantum } | SchedParam::FixedPrio { prio, quantum } => {
                let prio = core::cmp::min(prio, MAX_PRIO as usize) as u8;
                let quantum = if quantum == 0 { DEFAULT_TIME_SLICE_US } else { quantum as u64 };
                self.class.store(SchedClass::FixedPrio as u8, Ordering::Relaxed);
                self.prio.store(prio, Ordering::Relaxed);
                self.quantum.store(quantum, Ordering::Relaxed);
            }
            SchedParam::Wfq { quantum, weight } => {
                if quantum == 0 || weight == 0 {
                    return Err(ParamError::Inval);
                }
                self.class.store(SchedClass::Wfq as u8, Ordering::Relaxed);
                self.prio.store(0, Ordering::Relaxed);
                self.quantum.store(quantum as u64, Ordering::Relaxed);
                self.weight.store(weight as u64, Ordering::Relaxed);
                self.qdw.store((quantum / weight) as u64, Ordering::Relaxed);
            }
            SchedParam::Unknown(class) => {
                warn!("SchedContext::set(): unknown scheduling class {}", class);
                return Err(ParamError::Range);
            }
        }
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn class(&self) -> SchedClass {
        if self.class.load(Ordering::Relaxed) == SchedClass::Wfq as u8 {
            SchedClass::Wfq
        } else {
            SchedClass::FixedPrio
        }
    }

    pub fn prio(&self) -> u8 {
        self.prio.load(Ordering::Relaxed)
    }

    pub fn set_prio(&self, prio: u8) {
        self.prio.store(prio, Ordering::Relaxed);
    }

    pub fn quantum(&self) -> u64 {
        self.quantum.load(Ordering::Relaxed)
    }

    pub fn set_quantum(&self, quantum: u64) {
        self.quantum.store(quantum, Ordering::Relaxed);
    }

    /// The remaining budget of the timeslice, in microseconds.
    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    pub fn set_left(&self, left: u64) {
        self.left.store(left, Ordering::Relaxed);
    }

    /// Consumes up to `us` of the remaining budget and returns what is left.
    pub fn consume(&self, us: u64) -> u64 {
        let left = self.left().saturating_sub(us);
        self.set_left(left);
        left
    }

    pub fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }

    pub fn set_deadline(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Relaxed);
    }

    pub fn weight(&self) -> u64 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Whether this context is currently on a ready queue.
    pub fn in_ready_list(&self) -> bool {
        self.in_ready_list.load(Ordering::Acquire)
    }

    /// Only for use by the ready queue.
    pub fn set_in_ready_list(&self, queued: bool) {
        self.in_ready_list.store(queued, Ordering::Release);
    }

    /// The priority used to order sender lists. WFQ contexts rank below every fixed priority.
    pub fn effective_prio(&self) -> usize {
        match self.class() {
            SchedClass::FixedPrio => self.prio() as usize + 1,
            SchedClass::Wfq => 0,
        }
    }

    /// Whether this context should preempt `other`.
    pub fn dominates(&self, other: &SchedContext) -> bool {
        if self.class() == SchedClass::FixedPrio {
            return self.prio() > other.prio();
        }
        if self.is_idle() || other.class() == SchedClass::FixedPrio {
            return false;
        }
        self.deadline() < other.deadline()
    }

    /// Resets the budget to a full quantum. WFQ contexts also move their deadline.
    pub fn replenish(&self) {
        self.set_left(self.quantum());
        if self.class() == SchedClass::Wfq {
            self.deadline.fetch_add(self.qdw.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for SchedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            SchedClass::FixedPrio => write!(
                f, "SchedContext#{}(prio {}, left {}/{}{})",
                self.id, self.prio(), self.left(), self.quantum(),
                if self.is_idle() { ", idle" } else { "" },
            ),
            SchedClass::Wfq => write!(
                f, "SchedContext#{}(wfq dl {}, w {}, left {}/{})",
                self.id, self.deadline(), self.weight(), self.left(), self.quantum(),
            ),
        }
    }
}

/// Whether two references name the same scheduling context.
pub fn same(a: &SchedContext, b: &SchedContext) -> bool {
    core::ptr::eq(a, b)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_prio_params_are_clamped() {
        let sc = SchedContext::new(1, 0);
        assert_eq!(sc.quantum(), DEFAULT_TIME_SLICE_US);

        sc.set(&SchedParam::Legacy { prio: 1000, quantum: 0 }).unwrap();
        assert_eq!(sc.prio(), 255);
        assert_eq!(sc.quantum(), DEFAULT_TIME_SLICE_US);

        sc.set(&SchedParam::FixedPrio { prio: 17, quantum: 3000 }).unwrap();
        assert_eq!((sc.prio(), sc.quantum()), (17, 3000));
        assert_eq!(sc.class(), SchedClass::FixedPrio);
    }

    #[test]
    fn bad_params_are_rejected() {
        let sc = SchedContext::new(5, 0);
        assert_eq!(sc.set(&SchedParam::Wfq { quantum: 0, weight: 1 }), Err(ParamError::Inval));
        assert_eq!(sc.set(&SchedParam::Wfq { quantum: 100, weight: 0 }), Err(ParamError::Inval));
        assert_eq!(sc.set(&SchedParam::Unknown(-3)), Err(ParamError::Range));
        assert_eq!(ErrorCode::from(ParamError::Range), ErrorCode::ERange);
        assert_eq!(SchedContext::check(&SchedParam::Wfq { quantum: 0, weight: 1 }), Err(ParamError::Inval));
        assert_eq!(SchedContext::check(&SchedParam::FixedPrio { prio: 400, quantum: 0 }), Ok(()));
        // a rejected update leaves the context unchanged
        assert_eq!((sc.class(), sc.prio()), (SchedClass::FixedPrio, 5));
    }

    #[test]
    fn dominance() {
        let hi = SchedContext::new(20, 0);
        let lo = SchedContext::new(10, 0);
        assert!(hi.dominates(&lo));
        assert!(!lo.dominates(&hi));
        assert!(!lo.dominates(&SchedContext::new(10, 0)));

        let a = SchedContext::new(0, 0);
        a.set(&SchedParam::Wfq { quantum: 1000, weight: 1 }).unwrap();
        let b = SchedContext::new(0, 0);
        b.set(&SchedParam::Wfq { quantum: 1000, weight: 2 }).unwrap();
        b.replenish();
        assert_eq!(b.deadline(), 500);
        assert!(!b.dominates(&a));
        assert!(a.dominates(&b));
        assert!(!a.dominates(&lo));
        assert!(lo.dominates(&a));
        assert!(!SchedContext::new_idle().dominates(&a));
    }

    #[test]
    fn replenish_restores_budget() {
        let sc = SchedContext::new(3, 2000);
        assert_eq!(sc.consume(2500), 0);
        sc.replenish();
        assert_eq!(sc.left(), 2000);
    }

    #[test]
    fn owner_is_recovered_by_type() {
        struct Thread(u32);
        let t = Arc::new(Thread(7));
        let sc = SchedContext::new(1, 0);
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&t) as Weak<dyn Any + Send + Sync>;
        sc.set_owner(weak);
        assert_eq!(sc.owner::<Thread>().map(|t| t.0), Some(7));
        assert!(sc.owner::<u64>().is_none());
        drop(t);
        assert!(sc.owner::<Thread>().is_none());
    }
}
