//! Clocks used by the scheduler for timeslice and consumed-time accounting.
//!
//! A [`ClockSource`] is a free-running counter (a cycle counter on real hardware,
//! a [`SoftCounter`] when hosted). Each CPU wraps its source in a [`Clock`],
//! whose [`delta()`](Clock::delta) is a consuming read: it returns the ticks
//! elapsed since the previous read and moves the baseline forward.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use kip::Kip;
use log::warn;

pub use core::time::Duration;

/// CPU time in microseconds.
pub type CpuTime = u64;

/// A monotonic hardware (or emulated) counter.
pub trait ClockSource: Send + Sync {
    /// Returns the current raw counter value.
    fn read_counter(&self) -> u64;
}

/// A counter that only moves when told to.
///
/// Used when there is no hardware counter, and by tests to drive time deterministically.
#[derive(Debug, Default)]
pub struct SoftCounter {
    ticks: AtomicU64,
}

impl SoftCounter {
    pub const fn new() -> SoftCounter {
        SoftCounter { ticks: AtomicU64::new(0) }
    }

    /// Moves the counter forward by `ticks` and returns the new value.
    pub fn advance(&self, ticks: u64) -> u64 {
        self.ticks.fetch_add(ticks, Ordering::AcqRel) + ticks
    }
}

impl ClockSource for SoftCounter {
    fn read_counter(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}


/// A per-CPU clock.
pub struct Clock {
    source: Arc<dyn ClockSource>,
    last: u64,
    /// Counter ticks per millisecond, i.e., the counter frequency in kHz.
    /// Zero means the counter already counts microseconds.
    khz: u64,
}

impl Clock {
    /// Creates a clock whose baseline is the current counter value.
    ///
    /// The tick-to-microsecond conversion is calibrated from the KIP's `frequency_cpu`.
    pub fn new(source: Arc<dyn ClockSource>, kip: &Kip) -> Clock {
        let khz = kip.frequency_cpu() as u64;
        if khz != 0 && khz < 1000 {
            warn!("Clock: CPU frequency of {} kHz is below 1 MHz, microsecond accounting will be coarse", khz);
        }
        let last = source.read_counter();
        Clock { source, last, khz }
    }

    /// Returns the raw counter value without consuming it.
    pub fn read_counter(&self) -> u64 {
        self.source.read_counter()
    }

    /// Returns the ticks elapsed since the last call and resets the baseline.
    pub fn delta(&mut self) -> u64 {
        let now = self.source.read_counter();
        let delta = now.wrapping_sub(self.last);
        self.last = now;
        delta
    }

    /// Converts counter ticks to microseconds.
    pub fn us(&self, ticks: u64) -> CpuTime {
        if self.khz == 0 {
            ticks
        } else {
            ((ticks as u128 * 1000) / self.khz as u128) as CpuTime
        }
    }

    /// Like [`delta()`](Self::delta), but in microseconds.
    pub fn delta_us(&mut self) -> CpuTime {
        let ticks = self.delta();
        self.us(ticks)
    }
}

/// Converts a microsecond count into a `Duration`.
pub fn to_duration(us: CpuTime) -> Duration {
    Duration::from_micros(us)
}
