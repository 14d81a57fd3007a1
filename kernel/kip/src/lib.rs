//! The kernel info page (KIP).
//!
//! The KIP is mapped read-only into every address space.
//! User space reads the system clock and the memory map from it,
//! so the offsets of its fields are part of the ABI and are checked at compile time.
//!
//! The kernel core only relies on a handful of fields:
//! the system clock (advanced by the timer tick), the CPU and bus frequencies
//! (used to calibrate per-CPU clocks), and the memory descriptor table.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate static_assertions;
#[macro_use] extern crate log;

use core::fmt;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_config::memory::KIP_MEM_DESCS;
use kernel_config::time::SCHEDULER_GRANULARITY_US;

/// The magic value at offset 0 of every KIP ("L4\xe6K").
pub const L4_KERNEL_INFO_MAGIC: u32 = 0x4BE6_344C;

/// The kernel version id reported in the KIP.
pub const KERNEL_VERSION_ID: u32 = 0x8700_4444;

/// The type of a memory region described by a [`MemDesc`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemType {
    Undefined    = 0x0,
    Conventional = 0x1,
    Reserved     = 0x2,
    Dedicated    = 0x3,
    Shared       = 0x4,
    KernelTmp    = 0x7,
    Info         = 0xd,
    Bootloader   = 0xe,
    Arch         = 0xf,
}

impl MemType {
    pub fn from_bits(bits: u8) -> Option<MemType> {
        Some(match bits {
            0x0 => MemType::Undefined,
            0x1 => MemType::Conventional,
            0x2 => MemType::Reserved,
            0x3 => MemType::Dedicated,
            0x4 => MemType::Shared,
            0x7 => MemType::KernelTmp,
            0xd => MemType::Info,
            0xe => MemType::Bootloader,
            0xf => MemType::Arch,
            _ => return None,
        })
    }
}

/// One entry of the KIP memory map.
///
/// Regions are 1 KiB granular: the low 10 bits of the first word carry the
/// type (bits 0..4), the sub-type (bits 4..8) and the virtual flag (bit 9);
/// the second word holds the inclusive end address.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MemDesc {
    l: u64,
    h: u64,
}

impl MemDesc {
    const TYPE_MASK: u64 = 0xf;
    const SUB_TYPE_MASK: u64 = 0xf0;
    const VIRTUAL: u64 = 0x200;
    const GRANULE_MASK: u64 = 0x3ff;

    /// An unused descriptor slot.
    pub const EMPTY: MemDesc = MemDesc { l: 0, h: 0 };

    pub const fn new(start: u64, end: u64, mem_type: MemType, sub_type: u8, is_virtual: bool) -> MemDesc {
        let virt = if is_virtual { Self::VIRTUAL } else { 0 };
        MemDesc {
            l: (start & !Self::GRANULE_MASK)
                | (mem_type as u64 & Self::TYPE_MASK)
                | (((sub_type as u64) << 4) & Self::SUB_TYPE_MASK)
                | virt,
            h: end,
        }
    }

    pub const fn start(&self) -> u64 {
        self.l & !Self::GRANULE_MASK
    }

    /// The last address of the region (inclusive).
    pub const fn end(&self) -> u64 {
        self.h | Self::GRANULE_MASK
    }

    pub const fn size(&self) -> u64 {
        self.end() - self.start() + 1
    }

    /// The region type. Unknown type bits are reported as `Undefined`.
    pub fn mem_type(&self) -> MemType {
        MemType::from_bits((self.l & Self::TYPE_MASK) as u8).unwrap_or(MemType::Undefined)
    }

    pub const fn sub_type(&self) -> u8 {
        ((self.l & Self::SUB_TYPE_MASK) >> 4) as u8
    }

    pub const fn is_virtual(&self) -> bool {
        self.l & Self::VIRTUAL != 0
    }

    pub fn is_valid(&self) -> bool {
        self.mem_type() != MemType::Undefined
    }
}

impl fmt::Debug for MemDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}-{:#x}] {:?}({}){}",
            self.start(), self.end(), self.mem_type(), self.sub_type(),
            if self.is_virtual() { " virt" } else { "" },
        )
    }
}


/// The kernel info page.
#[repr(C)]
pub struct Kip {
    magic: u32,
    version: u32,
    sched_granularity: u32,
    _reserved0: u32,
    /// Upper half: byte offset of the descriptor table; lower half: number of descriptors.
    mem_info: u64,
    /// The system clock, in microseconds.
    clock: AtomicU64,
    /// CPU frequency in kHz.
    frequency_cpu: u32,
    /// Bus frequency in kHz.
    frequency_bus: u32,
    _reserved1: [u64; 3],
    mem_descs: [MemDesc; KIP_MEM_DESCS],
}

const_assert_eq!(offset_of!(Kip, magic), 0x00);
const_assert_eq!(offset_of!(Kip, version), 0x04);
const_assert_eq!(offset_of!(Kip, mem_info), 0x10);
const_assert_eq!(offset_of!(Kip, clock), 0x18);
const_assert_eq!(offset_of!(Kip, frequency_cpu), 0x20);
const_assert_eq!(offset_of!(Kip, frequency_bus), 0x24);
const_assert_eq!(offset_of!(Kip, mem_descs), 0x40);
assert_eq_size!(MemDesc, [u64; 2]);

impl Kip {
    /// Creates a KIP with an empty memory map and the system clock at zero.
    pub fn new(frequency_cpu_khz: u32, frequency_bus_khz: u32) -> Kip {
        let mem_info = ((offset_of!(Kip, mem_descs) as u64) << 32) | KIP_MEM_DESCS as u64;
        Kip {
            magic: L4_KERNEL_INFO_MAGIC,
            version: KERNEL_VERSION_ID,
            sched_granularity: SCHEDULER_GRANULARITY_US as u32,
            _reserved0: 0,
            mem_info,
            clock: AtomicU64::new(0),
            frequency_cpu: frequency_cpu_khz,
            frequency_bus: frequency_bus_khz,
            _reserved1: [0; 3],
            mem_descs: [MemDesc::EMPTY; KIP_MEM_DESCS],
        }
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn sched_granularity(&self) -> u32 {
        self.sched_granularity
    }

    pub fn frequency_cpu(&self) -> u32 {
        self.frequency_cpu
    }

    pub fn frequency_bus(&self) -> u32 {
        self.frequency_bus
    }

    /// Returns the current system clock in microseconds.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn set_clock(&self, us: u64) {
        self.clock.store(us, Ordering::Release);
    }

    /// Advances the system clock by `us` and returns the new value.
    pub fn advance_clock(&self, us: u64) -> u64 {
        self.clock.fetch_add(us, Ordering::AcqRel) + us
    }

    /// Moves the system clock forward to `us`, never backwards. Returns the new value.
    pub fn advance_clock_to(&self, us: u64) -> u64 {
        core::cmp::max(self.clock.fetch_max(us, Ordering::AcqRel), us)
    }

    /// The byte offset of the memory descriptor table from the start of the KIP.
    pub fn mem_desc_offset(&self) -> usize {
        (self.mem_info >> 32) as usize
    }

    pub fn num_mem_descs(&self) -> usize {
        (self.mem_info & 0xffff_ffff) as usize
    }

    /// Returns all descriptor slots, including unused ones.
    pub fn mem_descs(&self) -> &[MemDesc] {
        &self.mem_descs[..self.num_mem_descs()]
    }

    /// Iterates over the valid (non-`Undefined`) memory regions.
    pub fn mem_regions(&self) -> impl Iterator<Item = &MemDesc> {
        self.mem_descs().iter().filter(|md| md.is_valid())
    }

    /// Records a memory region in the first unused descriptor slot.
    pub fn add_mem_region(&mut self, md: MemDesc) -> Result<(), &'static str> {
        let count = self.num_mem_descs();
        match self.mem_descs[..count].iter_mut().find(|slot| !slot.is_valid()) {
            Some(slot) => {
                *slot = md;
                Ok(())
            }
            None => {
                warn!("KIP memory map full, dropping region {:?}", md);
                Err("no free memory descriptor in the KIP")
            }
        }
    }

    /// Sums the sizes of all regions of the given type.
    pub fn total_memory(&self, mem_type: MemType) -> u64 {
        self.mem_regions()
            .filter(|md| md.mem_type() == mem_type)
            .map(MemDesc::size)
            .sum()
    }
}

impl fmt::Debug for Kip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kip")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("version", &format_args!("{:#x}", self.version))
            .field("clock", &self.clock())
            .field("frequency_cpu", &self.frequency_cpu)
            .field("frequency_bus", &self.frequency_bus)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let kip = Kip::new(2_000_000, 100_000);
        assert_eq!(kip.magic(), L4_KERNEL_INFO_MAGIC);
        assert_eq!(kip.sched_granularity() as u64, SCHEDULER_GRANULARITY_US);
        assert_eq!(kip.mem_desc_offset(), 0x40);
        assert_eq!(kip.num_mem_descs(), KIP_MEM_DESCS);
        assert_eq!(kip.advance_clock(1000), 1000);
        assert_eq!(kip.clock(), 1000);
        assert_eq!(kip.advance_clock_to(500), 1000);
        assert_eq!(kip.advance_clock_to(3000), 3000);
    }

    #[test]
    fn mem_desc_encoding() {
        let md = MemDesc::new(0x10_0000, 0x1ff_ffff, MemType::Conventional, 3, true);
        assert_eq!(md.start(), 0x10_0000);
        assert_eq!(md.end(), 0x1ff_ffff);
        assert_eq!(md.size(), 0x1f0_0000);
        assert_eq!(md.mem_type(), MemType::Conventional);
        assert_eq!(md.sub_type(), 3);
        assert!(md.is_virtual());

        // unaligned start addresses are truncated to the 1 KiB granule
        let md = MemDesc::new(0x1234, 0x1fff, MemType::Reserved, 0, false);
        assert_eq!(md.start(), 0x1000);
        assert!(!md.is_virtual());
    }

    #[test]
    fn add_mem_region_fills_first_free_slot() {
        let mut kip = Kip::new(1_000_000, 0);
        kip.add_mem_region(MemDesc::new(0, 0x9_ffff, MemType::Conventional, 0, false)).unwrap();
        kip.add_mem_region(MemDesc::new(0xa_0000, 0xf_ffff, MemType::Arch, 0, false)).unwrap();
        kip.add_mem_region(MemDesc::new(0x10_0000, 0x20_03ff, MemType::Conventional, 0, false)).unwrap();
        assert_eq!(kip.mem_regions().count(), 3);
        assert_eq!(kip.mem_descs()[1].mem_type(), MemType::Arch);
        assert_eq!(kip.total_memory(MemType::Conventional), 0xa_0000 + 0x10_0400);

        for _ in 3..KIP_MEM_DESCS {
            kip.add_mem_region(MemDesc::new(0, 0, MemType::Reserved, 0, false)).unwrap();
        }
        assert!(kip.add_mem_region(MemDesc::new(0, 0, MemType::Shared, 0, false)).is_err());
    }
}
