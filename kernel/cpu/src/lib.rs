//! An abstraction for naming and grouping CPUs (cores) in an SMP system.
//!
//! * [`CpuId`] names one CPU.
//! * [`CpuMask`] is a set of CPUs, e.g. the present or online CPUs.
//! * [`CpuSet`] is the affinity descriptor user space hands to the scheduler:
//!   a bitmap with an offset and a granularity, one bit per `1 << granularity` CPUs.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate static_assertions;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::atomic::AtomicCell;
use derive_more::{Display, Binary, Octal, LowerHex, UpperHex};
use kernel_config::sched::MAX_CPUS;

/// A unique identifier for a CPU.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord,
    Hash, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// The CPU that boots the system and keeps the system time.
    pub const BOOT: CpuId = CpuId(0);

    pub const fn new(id: u32) -> CpuId {
        CpuId(id)
    }

    /// Returns the inner raw value of this `CpuId`.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns this `CpuId` as an index into per-CPU tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for CpuId {
    fn from(id: u32) -> Self {
        CpuId(id)
    }
}

impl From<CpuId> for u32 {
    fn from(cpu: CpuId) -> Self {
        cpu.0
    }
}

/// An equivalent to `Option<CpuId>`, which internally encodes `None` as `u32::MAX`.
///
/// This keeps it the size of a `u32`, so an `AtomicCell<OptionalCpuId>`
/// compiles down to lock-free native atomic instructions.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct OptionalCpuId(u32);

impl OptionalCpuId {
    pub const NONE: OptionalCpuId = OptionalCpuId(u32::MAX);
}

impl From<Option<CpuId>> for OptionalCpuId {
    fn from(opt: Option<CpuId>) -> Self {
        match opt.map(|v| v.0) {
            Some(u32::MAX) => panic!("CpuId is too big!"),
            Some(cpu_id) => OptionalCpuId(cpu_id),
            None => OptionalCpuId::NONE,
        }
    }
}

impl From<OptionalCpuId> for Option<CpuId> {
    fn from(val: OptionalCpuId) -> Self {
        match val.0 {
            u32::MAX => None,
            v => Some(CpuId(v)),
        }
    }
}

impl fmt::Debug for OptionalCpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", Option::<CpuId>::from(*self))
    }
}

const_assert!(AtomicCell::<CpuId>::is_lock_free());
const_assert!(AtomicCell::<OptionalCpuId>::is_lock_free());
const_assert!(MAX_CPUS <= 64);


/// A set of CPUs, one bit per CPU.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> CpuMask {
        CpuMask(0)
    }

    /// Returns a mask containing the first `count` CPUs.
    pub fn first_n(count: usize) -> CpuMask {
        let count = count.min(MAX_CPUS);
        if count == 64 { CpuMask(u64::MAX) } else { CpuMask((1u64 << count) - 1) }
    }

    pub const fn from_bits(bits: u64) -> CpuMask {
        CpuMask(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, cpu: CpuId) -> bool {
        cpu.index() < MAX_CPUS && self.0 & (1 << cpu.0) != 0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        if cpu.index() < MAX_CPUS {
            self.0 |= 1 << cpu.0;
        }
    }

    pub fn remove(&mut self, cpu: CpuId) {
        if cpu.index() < MAX_CPUS {
            self.0 &= !(1 << cpu.0);
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Returns the lowest-numbered CPU in this mask.
    pub fn first(self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(CpuId(self.0.trailing_zeros()))
        }
    }

    /// Iterates over the CPUs in this mask in ascending order.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS as u32).filter(move |i| self.0 & (1 << i) != 0).map(CpuId)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A `CpuMask` that can be shared and updated across CPUs.
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new(mask: CpuMask) -> AtomicCpuMask {
        AtomicCpuMask(AtomicU64::new(mask.0))
    }

    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }

    /// Adds `cpu`, returning whether it was absent before.
    pub fn insert(&self, cpu: CpuId) -> bool {
        if cpu.index() >= MAX_CPUS {
            return false;
        }
        let bit = 1 << cpu.0;
        self.0.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Removes `cpu`, returning whether it was present before.
    pub fn remove(&self, cpu: CpuId) -> bool {
        if cpu.index() >= MAX_CPUS {
            return false;
        }
        let bit = 1 << cpu.0;
        self.0.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.load().contains(cpu)
    }
}


/// An L4 CPU set: `map` bit `n` selects CPUs
/// `offset + (n << granularity) .. offset + ((n + 1) << granularity)`.
///
/// On the wire it is two words: the descriptor word holding the granularity
/// in bits 24..32 and the offset in bits 0..24, followed by the map word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSet {
    granularity: u8,
    offset: u32,
    map: u64,
}

impl CpuSet {
    pub const fn new(granularity: u8, offset: u32, map: u64) -> CpuSet {
        CpuSet { granularity, offset: offset & 0x00ff_ffff, map }
    }

    /// A set containing every CPU.
    pub const fn all() -> CpuSet {
        CpuSet::new(0, 0, u64::MAX)
    }

    /// Decodes a CPU set from its descriptor word and map word.
    pub const fn from_words(descr: u64, map: u64) -> CpuSet {
        CpuSet::new(((descr >> 24) & 0xff) as u8, (descr & 0x00ff_ffff) as u32, map)
    }

    /// Returns the descriptor word of this set.
    pub const fn descr_word(&self) -> u64 {
        ((self.granularity as u64) << 24) | self.offset as u64
    }

    pub const fn map(&self) -> u64 {
        self.map
    }

    pub const fn granularity(&self) -> u8 {
        self.granularity
    }

    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns whether `cpu` is selected by this set.
    pub fn contains(&self, cpu: CpuId) -> bool {
        if self.offset > cpu.0 {
            return false;
        }
        let shift = self.granularity as u32;
        if shift >= 32 {
            return self.map & 1 != 0;
        }
        let bit = (cpu.0 - self.offset) >> shift;
        if bit >= u64::BITS {
            return false;
        }
        self.map & (1 << bit) != 0
    }

    /// Returns the lowest-numbered CPU of `available` that this set selects.
    pub fn first(&self, available: CpuMask) -> Option<CpuId> {
        available.iter().find(|cpu| self.contains(*cpu))
    }
}
