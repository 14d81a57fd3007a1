//! Tasks and their capability tables.

use crate::{Kobject, KobjectRef};
use abi::{ErrorCode, Rights};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use context::{HostedSpace, MemSpace};
use kernel_config::memory::KOBJECT_QUOTA_SIZE;
use ram_quota::{QuotaCharge, RamQuota};
use spin::Mutex;

/// Maps capability indices to kernel objects and the rights held on them.
pub struct CapTable {
    caps: Mutex<BTreeMap<usize, (KobjectRef, Rights)>>,
}

impl CapTable {
    pub fn new() -> CapTable {
        CapTable { caps: Mutex::new(BTreeMap::new()) }
    }

    /// Maps `obj` at `cap` with `rights`.
    ///
    /// Returns an error if `cap` is taken or `rights` lacks [`Rights::CR`],
    /// without which a capability does not exist.
    pub fn insert(&self, cap: usize, obj: KobjectRef, rights: Rights) -> Result<(), &'static str> {
        if !rights.contains(Rights::CR) {
            return Err("a capability needs the read right");
        }
        let mut caps = self.caps.lock();
        if caps.contains_key(&cap) {
            return Err("capability index is in use");
        }
        trace!("CapTable: {} at {:#x} with {:?}", obj.kind(), cap, rights);
        caps.insert(cap, (obj, rights));
        Ok(())
    }

    pub fn lookup(&self, cap: usize) -> Option<(KobjectRef, Rights)> {
        self.caps.lock().get(&cap).cloned()
    }

    /// Unmaps `cap`, returning what was mapped there.
    pub fn remove(&self, cap: usize) -> Option<KobjectRef> {
        self.caps.lock().remove(&cap).map(|(obj, _)| obj)
    }

    pub fn len(&self) -> usize {
        self.caps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CapTable {
    fn default() -> CapTable {
        CapTable::new()
    }
}

/// A protection domain: an address space plus a capability table.
///
/// The address space is a [`HostedSpace`], which only counts how often it
/// was switched to.
pub struct Task {
    space: Arc<HostedSpace>,
    caps: CapTable,
    quota: Arc<RamQuota>,
    _charge: QuotaCharge,
}

impl Task {
    /// Creates an empty task whose kernel objects are charged to `quota`.
    pub fn new(quota: &Arc<RamQuota>) -> Result<Arc<Task>, ErrorCode> {
        let charge = quota.charge(KOBJECT_QUOTA_SIZE).map_err(|_| ErrorCode::ENomem)?;
        let task = Arc::new(Task {
            space: HostedSpace::new(),
            caps: CapTable::new(),
            quota: quota.clone(),
            _charge: charge,
        });
        debug!("created {:?}", task);
        Ok(task)
    }

    pub fn caps(&self) -> &CapTable {
        &self.caps
    }

    pub fn quota(&self) -> &Arc<RamQuota> {
        &self.quota
    }

    /// Looks up `cap` in this task's table.
    pub fn lookup(&self, cap: usize) -> Option<(KobjectRef, Rights)> {
        self.caps.lookup(cap)
    }

    /// How often a context of this task was switched to from another space.
    pub fn switch_ins(&self) -> usize {
        self.space.switchins()
    }
}

impl MemSpace for Task {
    fn id(&self) -> usize {
        self.space.id()
    }

    fn switchin_context(&self, from: Option<&dyn MemSpace>) {
        self.space.switchin_context(from);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.space.id())
    }
}
