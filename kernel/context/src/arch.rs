//! The interfaces the scheduler consumes from the architecture layer,
//! plus hosted implementations of them that simply record what happened.

use crate::Context;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Saves the register state of one context and restores that of another.
pub trait ArchSwitch: Send {
    /// Switches this CPU from `from` to `to`, including their memory spaces.
    ///
    /// Returns with the CPU lock in the same state it was called with.
    fn switch_cpu(&mut self, from: &Context, to: &Context);
}

/// An address space that contexts execute in.
pub trait MemSpace: Send + Sync {
    fn id(&self) -> usize;

    /// Makes this space the active one. `from` is the space being left, if any.
    fn switchin_context(&self, from: Option<&dyn MemSpace>);
}

/// Whether two optional spaces are the same one.
pub fn same_space(a: Option<&dyn MemSpace>, b: Option<&dyn MemSpace>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id() == b.id(),
        (None, None) => true,
        _ => false,
    }
}


/// One switch recorded by [`HostedArch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchRecord {
    pub from: usize,
    pub to: usize,
    /// Whether the memory space was switched as well.
    pub space_switch: bool,
}

/// An [`ArchSwitch`] for running the kernel core as an ordinary program.
///
/// There are no registers to save; it records every switch and performs the
/// memory-space switch through [`MemSpace::switchin_context()`].
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct HostedArch {
    log: Arc<Mutex<Vec<SwitchRecord>>>,
}

impl HostedArch {
    pub fn new() -> HostedArch {
        HostedArch::default()
    }

    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.log.lock().clone()
    }

    pub fn last(&self) -> Option<SwitchRecord> {
        self.log.lock().last().copied()
    }

    pub fn count(&self) -> usize {
        self.log.lock().len()
    }
}

impl ArchSwitch for HostedArch {
    fn switch_cpu(&mut self, from: &Context, to: &Context) {
        let space_switch = match to.space() {
            Some(to_space) if !same_space(from.space(), Some(to_space)) => {
                to_space.switchin_context(from.space());
                true
            }
            _ => false,
        };
        self.log.lock().push(SwitchRecord { from: from.id(), to: to.id(), space_switch });
    }
}


/// A [`MemSpace`] without page tables that counts how often it was switched to.
#[derive(Debug)]
pub struct HostedSpace {
    id: usize,
    switchins: AtomicUsize,
}

static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(1);

impl HostedSpace {
    pub fn new() -> Arc<HostedSpace> {
        Arc::new(HostedSpace {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            switchins: AtomicUsize::new(0),
        })
    }

    pub fn switchins(&self) -> usize {
        self.switchins.load(Ordering::Relaxed)
    }
}

impl MemSpace for HostedSpace {
    fn id(&self) -> usize {
        self.id
    }

    fn switchin_context(&self, from: Option<&dyn MemSpace>) {
        trace!("HostedSpace {}: switched in (from {:?})", self.id, from.map(|s| s.id()));
        self.switchins.fetch_add(1, Ordering::Relaxed);
    }
}
