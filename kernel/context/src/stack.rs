//! The kernel stack of a context.
//!
//! Every stack is aligned to its own size, [`KERNEL_STACK_SIZE`], and starts with a
//! small header that records its owner. Masking any address inside the stack
//! therefore yields the header, which is how the running context is found from
//! its stack pointer.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_config::memory::KERNEL_STACK_SIZE;

#[repr(C)]
struct StackHeader {
    owner: AtomicUsize,
}

/// A kernel stack, exclusively owned by one context and freed when dropped.
pub struct KernelStack {
    base: *mut u8,
}

// The stack memory is only ever accessed through the header's atomic
// or by the context that owns the stack.
unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    fn layout() -> Layout {
        // KERNEL_STACK_SIZE is a non-zero power of two, checked in kernel_config.
        unsafe { Layout::from_size_align_unchecked(KERNEL_STACK_SIZE, KERNEL_STACK_SIZE) }
    }

    /// Allocates a new zeroed stack without an owner.
    pub fn new() -> Result<KernelStack, &'static str> {
        let base = unsafe { alloc_zeroed(Self::layout()) };
        if base.is_null() {
            error!("KernelStack::new(): out of memory");
            return Err("couldn't allocate a kernel stack");
        }
        Ok(KernelStack { base })
    }

    fn header(&self) -> &StackHeader {
        unsafe { &*(self.base as *const StackHeader) }
    }

    /// The lowest address of this stack.
    pub fn bottom(&self) -> usize {
        self.base as usize
    }

    /// The address just beyond the top of this stack.
    pub fn top(&self) -> usize {
        self.bottom() + KERNEL_STACK_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.bottom()..self.top()).contains(&addr)
    }

    pub(crate) fn set_owner(&self, owner: usize) {
        self.header().owner.store(owner, Ordering::Release);
    }

    pub(crate) fn owner(&self) -> usize {
        self.header().owner.load(Ordering::Acquire)
    }

    /// Reads the owner recorded in the header of the stack that contains `addr`.
    ///
    /// # Safety
    /// `addr` must lie within a live `KernelStack`.
    pub(crate) unsafe fn owner_of(addr: usize) -> usize {
        let header = (addr & !(KERNEL_STACK_SIZE - 1)) as *const StackHeader;
        (*header).owner.load(Ordering::Acquire)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, Self::layout()) };
    }
}

impl fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelStack({:#x}..{:#x})", self.bottom(), self.top())
    }
}
