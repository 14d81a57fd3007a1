//! Kernel-memory quotas.
//!
//! Every kernel object (threads, IPC gates, semaphores, tasks) is charged
//! against a [`RamQuota`] when it is created.
//! Quotas form a tree: creating a child quota charges its limit to the parent,
//! and dropping the child returns it.
//!
//! A charge is normally held through a [`QuotaCharge`], which gives the bytes
//! back when dropped.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A kernel-memory budget.
pub struct RamQuota {
    parent: Option<Arc<RamQuota>>,
    max: usize,
    current: AtomicUsize,
}

impl RamQuota {
    /// Creates a root quota that is not accounted anywhere else.
    pub fn new_root(max: usize) -> Arc<RamQuota> {
        Arc::new(RamQuota {
            parent: None,
            max,
            current: AtomicUsize::new(0),
        })
    }

    /// Creates a child quota of `max` bytes, charging the parent for it.
    ///
    /// The child's own bookkeeping is not charged.
    pub fn new_child(parent: &Arc<RamQuota>, max: usize) -> Result<Arc<RamQuota>, &'static str> {
        if !parent.alloc(max) {
            warn!("RamQuota: cannot carve a child quota of {} bytes out of {:?}", max, parent);
            return Err("parent quota exhausted");
        }
        Ok(Arc::new(RamQuota {
            parent: Some(parent.clone()),
            max,
            current: AtomicUsize::new(0),
        }))
    }

    /// Tries to charge `bytes` to this quota. Returns false if the limit would be exceeded.
    pub fn alloc(&self, bytes: usize) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(bytes).filter(|&new| new <= self.max)
            })
            .is_ok()
    }

    /// Returns `bytes` previously obtained with [`alloc()`](Self::alloc).
    pub fn free(&self, bytes: usize) {
        let prev = self.current.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "RamQuota: freeing more than was allocated");
    }

    /// Charges `bytes` and returns a guard that frees them when dropped.
    pub fn charge(self: &Arc<Self>, bytes: usize) -> Result<QuotaCharge, &'static str> {
        if self.alloc(bytes) {
            Ok(QuotaCharge { quota: self.clone(), bytes })
        } else {
            warn!("RamQuota: denied {} bytes ({:?})", bytes, self);
            Err("kernel memory quota exceeded")
        }
    }

    pub fn limit(&self) -> usize {
        self.max
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.max.saturating_sub(self.current())
    }

    pub fn parent(&self) -> Option<&Arc<RamQuota>> {
        self.parent.as_ref()
    }
}

impl Drop for RamQuota {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.as_ref() {
            parent.free(self.max);
        }
    }
}

impl fmt::Debug for RamQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RamQuota({}/{})", self.current(), self.max)
    }
}


/// An amount of memory charged to a [`RamQuota`], returned on drop.
pub struct QuotaCharge {
    quota: Arc<RamQuota>,
    bytes: usize,
}

impl QuotaCharge {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn quota(&self) -> &Arc<RamQuota> {
        &self.quota
    }
}

impl Drop for QuotaCharge {
    fn drop(&mut self) {
        self.quota.free(self.bytes);
    }
}

impl fmt::Debug for QuotaCharge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuotaCharge({} bytes of {:?})", self.bytes, self.quota)
    }
}
