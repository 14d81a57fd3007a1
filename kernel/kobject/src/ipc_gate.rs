//! IPC gates: named endpoints that deliver to a bound thread with a fixed label.

use crate::{fail, ipc_to, Invocation, Kobject, ThreadObject};
use abi::{ErrorCode, L4Error, Mword, Rights};
use alloc::sync::Arc;
use context::ContextRef;
use ipc::IpcOutcome;
use kernel_config::memory::KOBJECT_QUOTA_SIZE;
use ram_quota::{QuotaCharge, RamQuota};
use scheduler::CpuSched;
use spin::Mutex;

pub struct IpcGate {
    thread: Mutex<Option<ContextRef>>,
    id: Mword,
    _charge: QuotaCharge,
}

impl IpcGate {
    /// Creates an unbound gate whose label is `id`.
    ///
    /// The two low bits of `id` are ignored: they carry the invoker's
    /// [`Rights::LABEL_MASK`] rights on delivery.
    pub fn new(quota: &Arc<RamQuota>, id: Mword) -> Result<Arc<IpcGate>, ErrorCode> {
        let charge = quota.charge(KOBJECT_QUOTA_SIZE).map_err(|_| ErrorCode::ENomem)?;
        Ok(Arc::new(IpcGate {
            thread: Mutex::new(None),
            id: id & !(Rights::LABEL_MASK.bits() as Mword),
            _charge: charge,
        }))
    }

    /// Binds the gate to `thread`, replacing any previous binding.
    pub fn bind(&self, thread: &ThreadObject) {
        debug!("binding IPC gate {:#x} to {:?}", self.id, thread.context());
        *self.thread.lock() = Some(thread.context().clone());
    }

    pub fn unbind(&self) {
        self.thread.lock().take();
    }

    pub fn id(&self) -> Mword {
        self.id
    }

    /// The label a receiver sees for a message sent with `rights`.
    pub fn label(&self, rights: Rights) -> Mword {
        self.id | (rights & Rights::LABEL_MASK).bits() as Mword
    }
}

impl Kobject for IpcGate {
    fn kind(&self) -> &'static str {
        "ipc_gate"
    }

    fn invoke(&self, cs: &mut CpuSched, inv: &Invocation<'_>) -> IpcOutcome {
        let bound = self.thread.lock().clone();
        match bound {
            Some(thread) => ipc_to(cs, inv, &thread, self.label(inv.rights)),
            None => fail(&inv.caller, L4Error::NotExistent),
        }
    }
}
