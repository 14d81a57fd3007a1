//! This crate contains the `ReadyQueue`, the per-CPU list of runnable scheduling contexts.
//!
//! Fixed-priority contexts live in one FIFO list per priority level, with a bitmap
//! of non-empty levels so that the head can be found without scanning.
//! WFQ contexts live in a heap ordered by their virtual deadline.
//! Fixed-priority contexts always run before WFQ ones, and the idle context
//! runs when nothing else is ready.
//!
//! The ready queue also caches the "current" scheduling context, i.e., the
//! timeslice that is being consumed right now. It may belong to a different
//! thread than the one executing, see [`ReadyQueue::deblock()`].

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;


use alloc::collections::VecDeque;
use alloc::vec::Vec;
use alloc::sync::Arc;
use kernel_config::sched::{MAX_WFQ_READY, PRIO_LEVELS};
use sched_context::{SchedClass, SchedContext, SchedContextRef};

const BITMAP_WORDS: usize = PRIO_LEVELS / 64;

/// The fixed-priority part: one round-robin list per priority.
struct FpQueue {
    lists: Vec<VecDeque<SchedContextRef>>,
    bitmap: [u64; BITMAP_WORDS],
}

impl FpQueue {
    fn new() -> FpQueue {
        FpQueue {
            lists: (0..PRIO_LEVELS).map(|_| VecDeque::new()).collect(),
            bitmap: [0; BITMAP_WORDS],
        }
    }

    fn mark(&mut self, prio: usize) {
        self.bitmap[prio / 64] |= 1 << (prio % 64);
    }

    fn unmark_if_empty(&mut self, prio: usize) {
        if self.lists[prio].is_empty() {
            self.bitmap[prio / 64] &= !(1 << (prio % 64));
        }
    }

    fn highest_prio(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .rev()
            .find(|(_, &word)| word != 0)
            .map(|(i, &word)| i * 64 + 63 - word.leading_zeros() as usize)
    }

    fn enqueue(&mut self, sc: SchedContextRef, is_current: bool) {
        let prio = sc.prio() as usize;
        if is_current {
            self.lists[prio].push_front(sc);
        } else {
            self.lists[prio].push_back(sc);
        }
        self.mark(prio);
    }

    fn dequeue(&mut self, sc: &SchedContext) -> bool {
        // The context may have been re-prioritized while queued.
        let prio = sc.prio() as usize;
        if remove_from(&mut self.lists[prio], sc) {
            self.unmark_if_empty(prio);
            return true;
        }
        for prio in 0..PRIO_LEVELS {
            if remove_from(&mut self.lists[prio], sc) {
                self.unmark_if_empty(prio);
                return true;
            }
        }
        false
    }

    fn head(&self) -> Option<&SchedContextRef> {
        self.highest_prio().and_then(|prio| self.lists[prio].front())
    }

    fn len(&self) -> usize {
        self.lists.iter().map(VecDeque::len).sum()
    }
}

fn remove_from(list: &mut VecDeque<SchedContextRef>, sc: &SchedContext) -> bool {
    match list.iter().position(|e| sched_context::same(e, sc)) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

/// The WFQ part: a binary min-heap keyed on the virtual deadline.
struct WfqQueue {
    heap: Vec<SchedContextRef>,
}

impl WfqQueue {
    fn new() -> WfqQueue {
        WfqQueue { heap: Vec::new() }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.heap[a].deadline() < self.heap[b].deadline()
    }

    fn heap_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn heap_down(&mut self, mut i: usize) {
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if l < self.heap.len() && self.less(l, smallest) {
                smallest = l;
            }
            if r < self.heap.len() && self.less(r, smallest) {
                smallest = r;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }

    fn enqueue(&mut self, sc: SchedContextRef) {
        if self.heap.len() >= MAX_WFQ_READY {
            error!("ReadyQueue: WFQ heap holds more than {} contexts", MAX_WFQ_READY);
        }
        self.heap.push(sc);
        let last = self.heap.len() - 1;
        self.heap_up(last);
    }

    fn dequeue(&mut self, sc: &SchedContext) -> bool {
        let pos = match self.heap.iter().position(|e| sched_context::same(e, sc)) {
            Some(pos) => pos,
            None => return false,
        };
        self.heap.swap_remove(pos);
        if pos < self.heap.len() {
            self.heap_down(pos);
            self.heap_up(pos);
        }
        true
    }

    fn head(&self) -> Option<&SchedContextRef> {
        self.heap.first()
    }
}


/// The ready queue of one CPU.
pub struct ReadyQueue {
    fp: FpQueue,
    wfq: WfqQueue,
    idle: Option<SchedContextRef>,
    current_sched: Option<SchedContextRef>,
}

impl ReadyQueue {
    pub fn new() -> ReadyQueue {
        ReadyQueue {
            fp: FpQueue::new(),
            wfq: WfqQueue::new(),
            idle: None,
            current_sched: None,
        }
    }

    /// Sets the context that runs when nothing else is ready. It is never queued.
    pub fn set_idle(&mut self, sc: SchedContextRef) {
        self.idle = Some(sc);
    }

    pub fn idle(&self) -> Option<&SchedContextRef> {
        self.idle.as_ref()
    }

    /// The timeslice that is being consumed right now, if it is still valid.
    pub fn current_sched(&self) -> Option<&SchedContextRef> {
        self.current_sched.as_ref()
    }

    /// Makes `sc` the current timeslice.
    pub fn activate(&mut self, sc: SchedContextRef) {
        self.current_sched = Some(sc);
    }

    /// Forgets the current timeslice, so the next scheduling decision picks a new one.
    pub fn invalidate_sched(&mut self) {
        self.current_sched = None;
    }

    fn is_current_sched(&self, sc: &SchedContext) -> bool {
        self.current_sched.as_ref().map_or(false, |cs| sched_context::same(cs, sc))
    }

    /// Inserts `sc`. The current timeslice goes to the head of its level,
    /// so that a preempted timeslice resumes before its peers.
    pub fn enqueue(&mut self, sc: SchedContextRef, is_current: bool) {
        if sc.in_ready_list() || sc.is_idle() {
            return;
        }
        sc.set_in_ready_list(true);
        match sc.class() {
            SchedClass::FixedPrio => self.fp.enqueue(sc, is_current),
            SchedClass::Wfq => self.wfq.enqueue(sc),
        }
    }

    /// Removes `sc` if it is queued.
    pub fn dequeue(&mut self, sc: &SchedContext) {
        if !sc.in_ready_list() {
            return;
        }
        let found = match sc.class() {
            SchedClass::FixedPrio => self.fp.dequeue(sc) || self.wfq.dequeue(sc),
            SchedClass::Wfq => self.wfq.dequeue(sc) || self.fp.dequeue(sc),
        };
        if !found {
            error!("ReadyQueue::dequeue(): {:?} is marked ready but not queued", sc);
        }
        sc.set_in_ready_list(false);
    }

    /// Idempotent enqueue.
    pub fn ready_enqueue(&mut self, sc: &SchedContextRef) {
        let is_current = self.is_current_sched(sc);
        self.enqueue(sc.clone(), is_current);
    }

    /// Idempotent dequeue.
    pub fn ready_dequeue(&mut self, sc: &SchedContext) {
        self.dequeue(sc);
    }

    /// Puts `sc` at the tail of its level, enqueueing it if necessary.
    pub fn requeue(&mut self, sc: &SchedContextRef) {
        if sc.in_ready_list() {
            self.dequeue(sc);
        }
        self.enqueue(sc.clone(), false);
    }

    /// Replaces `from` with `to` on this queue, e.g., after a parameter change.
    pub fn switch_sched(&mut self, from: &SchedContext, to: &SchedContextRef) {
        if self.is_current_sched(from) {
            self.invalidate_sched();
        }
        if from.in_ready_list() {
            self.dequeue(from);
        }
        self.enqueue(to.clone(), false);
    }

    /// Returns the context that should run next.
    pub fn next_to_run(&self) -> Option<SchedContextRef> {
        self.fp.head()
            .or_else(|| self.wfq.head())
            .or(self.idle.as_ref())
            .cloned()
    }

    /// Credits a WFQ context that slept past the current virtual time.
    ///
    /// Its deadline is pulled forward to the current timeslice's deadline and
    /// the lag is turned into budget, up to one quantum.
    pub fn deblock_refill(&mut self, sc: &SchedContext) {
        if sc.class() != SchedClass::Wfq {
            return;
        }
        let da = self.current_sched.as_ref()
            .filter(|cs| cs.class() == SchedClass::Wfq)
            .map_or(0, |cs| cs.deadline());
        if sc.deadline() >= da {
            return;
        }
        let left = sc.left() + (da - sc.deadline()) * sc.weight();
        sc.set_left(core::cmp::min(left, sc.quantum()));
        sc.set_deadline(da);
    }

    /// Makes `sc` ready and tells whether it should preempt.
    ///
    /// `sc` preempts only if it dominates both the current timeslice and `crs`,
    /// the running thread's own scheduling context. When the running thread helps
    /// on a donated timeslice, this keeps its own priority in effect.
    ///
    /// With `lazy` and a positive answer, `sc` is not enqueued: the caller is
    /// expected to switch to it directly.
    pub fn deblock(&mut self, sc: &SchedContextRef, crs: Option<&SchedContextRef>, lazy: bool) -> bool {
        let beats_running = crs.map_or(true, |crs| sc.dominates(crs));
        let reschedule = if self.is_current_sched(sc) {
            beats_running
        } else {
            self.deblock_refill(sc);
            let beats_current = self.current_sched.as_ref().map_or(true, |cs| sc.dominates(cs));
            beats_current && beats_running
        };
        trace!("ReadyQueue::deblock({:?}) -> {}", sc, reschedule);

        if reschedule && lazy {
            return true;
        }
        self.ready_enqueue(sc);
        reschedule
    }

    /// The number of queued contexts, not counting idle.
    pub fn len(&self) -> usize {
        self.fp.len() + self.wfq.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `sc` is the head of its class, i.e., would be picked if its class were the only one.
    pub fn is_head(&self, sc: &SchedContext) -> bool {
        let head = match sc.class() {
            SchedClass::FixedPrio => self.fp.head(),
            SchedClass::Wfq => self.wfq.head(),
        };
        head.map_or(false, |h| sched_context::same(h, sc))
    }

    /// Removes every queued context and returns them, highest priority first.
    /// The idle context stays.
    pub fn drain(&mut self) -> Vec<SchedContextRef> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(sc) = self.fp.head().or_else(|| self.wfq.head()).cloned() {
            self.dequeue(&sc);
            out.push(sc);
        }
        self.invalidate_sched();
        out
    }
}

impl Default for ReadyQueue {
    fn default() -> ReadyQueue {
        ReadyQueue::new()
    }
}

impl core::fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReadyQueue")
            .field("fixed_prio", &self.fp.len())
            .field("wfq", &self.wfq.heap.len())
            .field("current_sched", &self.current_sched)
            .finish()
    }
}

/// Whether two optional scheduling contexts are the same one.
pub fn same_opt(a: Option<&SchedContextRef>, b: Option<&SchedContextRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
