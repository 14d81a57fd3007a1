use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// The state of a [`Context`](crate::Context), a set of independent flags.
    ///
    /// A context is runnable iff any bit of [`READY_MASK`](ThreadState::READY_MASK) is set.
    pub struct ThreadState: u32 {
        const READY               = 0x1;
        /// Not ready, but has DRQs to handle.
        const DRQ_READY           = 0x2;
        /// Waiting in a receiver's sender list (polling).
        const SEND_WAIT           = 0x4;
        /// Waiting for a sender.
        const RECEIVE_WAIT        = 0x8;
        /// A sender is transferring a message to this context.
        const RECEIVE_IN_PROGRESS = 0x10;
        /// The message is in flight; set on the receiver during a handshake.
        const IPC_TRANSFER        = 0x20;
        /// The partner went away while this context was queued on it.
        const TRANSFER_FAILED     = 0x40;
        const CANCELED            = Self::TRANSFER_FAILED.bits;
        /// Someone asked this context to abort its IPC.
        const CANCEL              = 0x80;
        const TIMEOUT             = 0x100;
        const DEAD                = 0x200;
        const DYING               = 0x400;
        /// Migrated here, the armed timeout still has to be re-armed on this CPU.
        const FINISH_MIGRATION    = 0x1000;
        const NEED_RESCHED        = 0x2000;
        const FPU_OWNER           = 0x8000;
        /// Blocked until a DRQ sent to another CPU was handled.
        const DRQ_WAIT            = 0x100000;
        const WAITING             = 0x200000;
        const VCPU_ENABLED        = 0x400000;
        const VCPU_USER           = 0x800000;

        const READY_MASK      = Self::READY.bits | Self::DRQ_READY.bits;
        const IPC_MASK        = Self::SEND_WAIT.bits | Self::RECEIVE_WAIT.bits | Self::RECEIVE_IN_PROGRESS.bits;
        const FULL_IPC_MASK   = Self::IPC_MASK.bits | Self::CANCEL.bits | Self::TRANSFER_FAILED.bits
                              | Self::TIMEOUT.bits | Self::IPC_TRANSFER.bits;
        const IPC_ABORT_MASK  = Self::TRANSFER_FAILED.bits | Self::CANCEL.bits | Self::TIMEOUT.bits
                              | Self::IPC_TRANSFER.bits;
    }
}

impl ThreadState {
    /// Whether a context in this state may be picked by the scheduler.
    pub fn is_ready(self) -> bool {
        self.intersects(ThreadState::READY_MASK)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits())
    }
}


/// The atomic cell holding a [`ThreadState`].
///
/// The `*_dirty` operations are plain read-modify-write updates; they are atomic
/// with respect to other CPUs, but callers are expected to hold the lock of the
/// context's home CPU when a decision depends on the previous state.
pub(crate) struct AtomicThreadState(AtomicU32);

impl AtomicThreadState {
    pub(crate) const fn new(state: ThreadState) -> AtomicThreadState {
        AtomicThreadState(AtomicU32::new(state.bits()))
    }

    pub(crate) fn load(&self) -> ThreadState {
        ThreadState::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn add(&self, add: ThreadState) -> ThreadState {
        ThreadState::from_bits_truncate(self.0.fetch_or(add.bits(), Ordering::AcqRel))
    }

    pub(crate) fn del(&self, del: ThreadState) -> ThreadState {
        ThreadState::from_bits_truncate(self.0.fetch_and(!del.bits(), Ordering::AcqRel))
    }

    pub(crate) fn change(&self, del: ThreadState, add: ThreadState) -> ThreadState {
        let prev = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            Some((s & !del.bits()) | add.bits())
        });
        // the closure never fails
        ThreadState::from_bits_truncate(prev.unwrap_or_else(|s| s))
    }

    /// Applies the change only if every bit in `del` is set and no bit of `add`
    /// (that is not also deleted) is set already.
    pub(crate) fn change_safely(&self, del: ThreadState, add: ThreadState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                let already_added = s & add.bits() & !del.bits();
                let already_deleted = !s & del.bits();
                if already_added != 0 || already_deleted != 0 {
                    None
                } else {
                    Some((s & !del.bits()) | add.bits())
                }
            })
            .is_ok()
    }
}
