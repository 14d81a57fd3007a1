//! Timeouts and the per-CPU timeout queue.
//!
//! A timeout is anything implementing [`Timeout`]: it embeds a [`TimeoutState`]
//! holding its absolute wakeup time, and its [`expired()`](Timeout::expired)
//! method is called by [`TimeoutQueue::do_timeouts()`] once the CPU's clock
//! reaches that wakeup time. `expired()` returns whether a reschedule is needed.
//!
//! The queue is split into [`TIMEOUT_QUEUE_COUNT`] buckets by wakeup time,
//! `2^TIMEOUT_QUEUE_DISTANCE` µs apart, each sorted by wakeup.
//! A tick only scans the buckets that the clock moved across since the last tick.
//!
//! Timeouts are only ever touched by the CPU that owns the queue they are on.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;


use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_config::time::{ONE_SHOT_MAX_IDLE_US, TIMEOUT_QUEUE_COUNT, TIMEOUT_QUEUE_DISTANCE};
use ready_queue::ReadyQueue;
use sched_context::SchedContextRef;

/// What an expiring timeout may touch: the ready queue of the CPU it expires on.
pub struct ExpiryContext<'a> {
    pub rq: &'a mut ReadyQueue,
    /// The scheduling context of the thread running on this CPU.
    pub running: Option<SchedContextRef>,
    /// The current clock value.
    pub clock: u64,
}

/// The bookkeeping shared by every timeout.
#[derive(Debug)]
pub struct TimeoutState {
    wakeup: AtomicU64,
    hit: AtomicBool,
    queued: AtomicBool,
}

impl TimeoutState {
    pub const fn new() -> TimeoutState {
        TimeoutState {
            wakeup: AtomicU64::new(u64::MAX),
            hit: AtomicBool::new(false),
            queued: AtomicBool::new(false),
        }
    }

    /// The absolute wakeup time in µs.
    pub fn wakeup(&self) -> u64 {
        self.wakeup.load(Ordering::Relaxed)
    }

    /// Whether the timeout is armed, i.e., on a timeout queue.
    pub fn is_set(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether the timeout fired since it was last set.
    pub fn has_hit(&self) -> bool {
        self.hit.load(Ordering::Acquire)
    }

    /// The time remaining until the wakeup, negative if it lies in the past.
    pub fn remaining(&self, clock: u64) -> i64 {
        self.wakeup().wrapping_sub(clock) as i64
    }
}

impl Default for TimeoutState {
    fn default() -> TimeoutState {
        TimeoutState::new()
    }
}

/// A timeout that can be put on a [`TimeoutQueue`].
pub trait Timeout: Send + Sync {
    fn timeout_state(&self) -> &TimeoutState;

    /// Handles expiry. Returns true if a reschedule is necessary.
    fn expired(&self, cx: &mut ExpiryContext<'_>) -> bool;
}

pub type TimeoutRef = Arc<dyn Timeout>;

fn same(a: &dyn Timeout, b: &dyn Timeout) -> bool {
    core::ptr::eq(a.timeout_state(), b.timeout_state())
}

fn bucket_of(wakeup: u64) -> usize {
    ((wakeup >> TIMEOUT_QUEUE_DISTANCE) as usize) & (TIMEOUT_QUEUE_COUNT - 1)
}


/// The timeout queue of one CPU.
pub struct TimeoutQueue {
    buckets: [VecDeque<TimeoutRef>; TIMEOUT_QUEUE_COUNT],
    /// The wakeup a one-shot timer would be programmed for.
    current: u64,
    old_clock: u64,
}

impl TimeoutQueue {
    pub fn new() -> TimeoutQueue {
        TimeoutQueue {
            buckets: Default::default(),
            current: u64::MAX,
            old_clock: 0,
        }
    }

    fn enqueue(&mut self, to: TimeoutRef) {
        let wakeup = to.timeout_state().wakeup();
        let bucket = &mut self.buckets[bucket_of(wakeup)];
        let pos = bucket
            .iter()
            .position(|t| t.timeout_state().wakeup() >= wakeup)
            .unwrap_or(bucket.len());
        to.timeout_state().queued.store(true, Ordering::Release);
        bucket.insert(pos, to);

        if wakeup <= self.current {
            self.current = wakeup;
        }
    }

    /// Arms `to` to fire at the absolute time `wakeup`.
    ///
    /// # Panics
    /// If `to` is already armed.
    pub fn set(&mut self, to: TimeoutRef, wakeup: u64) {
        let state = to.timeout_state();
        assert!(!state.is_set(), "TimeoutQueue::set(): timeout is already armed");
        state.wakeup.store(wakeup, Ordering::Relaxed);
        state.hit.store(false, Ordering::Release);
        self.enqueue(to);
    }

    /// Re-arms `to` with its previous wakeup, unless it already fired.
    pub fn set_again(&mut self, to: TimeoutRef) {
        let state = to.timeout_state();
        assert!(!state.is_set(), "TimeoutQueue::set_again(): timeout is already armed");
        if state.has_hit() {
            return;
        }
        self.enqueue(to);
    }

    /// Disarms `to` if it is on this queue. Returns whether it was.
    pub fn reset(&mut self, to: &dyn Timeout) -> bool {
        let state = to.timeout_state();
        if !state.is_set() {
            return false;
        }
        let bucket = &mut self.buckets[bucket_of(state.wakeup())];
        match bucket.iter().position(|t| same(&**t, to)) {
            Some(pos) => {
                bucket.remove(pos);
                state.queued.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Removes `to` and, if `is_expired`, fires it as if its time had come.
    pub fn dequeue(&mut self, to: &TimeoutRef, is_expired: bool, cx: &mut ExpiryContext<'_>) -> bool {
        self.reset(&**to);
        if is_expired {
            expire(to, cx)
        } else {
            false
        }
    }

    /// Fires every timeout whose wakeup is at or before `cx.clock`.
    ///
    /// Returns true if any of them asked for a reschedule.
    pub fn do_timeouts(&mut self, cx: &mut ExpiryContext<'_>) -> bool {
        let clock = cx.clock;
        let mut reschedule = false;

        let first = self.old_clock >> TIMEOUT_QUEUE_DISTANCE;
        let diff = (clock >> TIMEOUT_QUEUE_DISTANCE).saturating_sub(first);
        let (mut idx, end) = if diff >= TIMEOUT_QUEUE_COUNT as u64 {
            // a complete miss: look at every bucket
            (0, 0)
        } else {
            (
                first as usize & (TIMEOUT_QUEUE_COUNT - 1),
                (first + diff + 1) as usize & (TIMEOUT_QUEUE_COUNT - 1),
            )
        };
        self.old_clock = clock;

        loop {
            while self.buckets[idx]
                .front()
                .map_or(false, |t| t.timeout_state().wakeup() <= clock)
            {
                if let Some(to) = self.buckets[idx].pop_front() {
                    to.timeout_state().queued.store(false, Ordering::Release);
                    reschedule |= expire(&to, cx);
                }
            }
            idx = (idx + 1) & (TIMEOUT_QUEUE_COUNT - 1);
            if idx == end {
                break;
            }
        }

        self.current = self.first_wakeup()
            .map_or(clock + ONE_SHOT_MAX_IDLE_US, |w| w.min(clock + ONE_SHOT_MAX_IDLE_US));

        reschedule
    }

    /// Whether any timeout other than `ignore` is armed.
    pub fn have_timeouts(&self, ignore: Option<&dyn Timeout>) -> bool {
        self.buckets.iter().any(|b| match (b.front(), ignore) {
            (None, _) => false,
            (Some(first), Some(ignore)) => !(same(&**first, ignore) && b.len() == 1),
            (Some(_), None) => true,
        })
    }

    /// The earliest wakeup of all armed timeouts.
    pub fn first_wakeup(&self) -> Option<u64> {
        self.buckets
            .iter()
            .filter_map(|b| b.front())
            .map(|t| t.timeout_state().wakeup())
            .min()
    }

    /// The wakeup a one-shot timer has to be programmed for.
    ///
    /// Never more than [`ONE_SHOT_MAX_IDLE_US`] after the last [`do_timeouts()`](Self::do_timeouts).
    pub fn next_wakeup(&self) -> u64 {
        self.current
    }

    /// The number of armed timeouts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every armed timeout, e.g., to move them to another CPU.
    pub fn drain(&mut self) -> alloc::vec::Vec<TimeoutRef> {
        let mut out = alloc::vec::Vec::new();
        for bucket in self.buckets.iter_mut() {
            for to in bucket.drain(..) {
                to.timeout_state().queued.store(false, Ordering::Release);
                out.push(to);
            }
        }
        self.current = u64::MAX;
        out
    }
}

impl Default for TimeoutQueue {
    fn default() -> TimeoutQueue {
        TimeoutQueue::new()
    }
}

fn expire(to: &TimeoutRef, cx: &mut ExpiryContext<'_>) -> bool {
    to.timeout_state().hit.store(true, Ordering::Release);
    let reschedule = to.expired(cx);
    trace!("timeout at {} fired (clock {}), reschedule: {}", to.timeout_state().wakeup(), cx.clock, reschedule);
    reschedule
}


/// The per-CPU timeout that ends the current timeslice.
#[derive(Debug, Default)]
pub struct TimesliceTimeout {
    state: TimeoutState,
}

impl TimesliceTimeout {
    pub fn new() -> Arc<TimesliceTimeout> {
        Arc::new(TimesliceTimeout { state: TimeoutState::new() })
    }
}

impl Timeout for TimesliceTimeout {
    fn timeout_state(&self) -> &TimeoutState {
        &self.state
    }

    /// Gives the current timeslice a fresh budget, puts it at the tail of its
    /// level and forces the next scheduling decision to pick a new one.
    fn expired(&self, cx: &mut ExpiryContext<'_>) -> bool {
        if let Some(sc) = cx.rq.current_sched().cloned() {
            sc.replenish();
            cx.rq.requeue(&sc);
            cx.rq.invalidate_sched();
        }
        true
    }
}
