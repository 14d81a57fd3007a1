//! The L4 system-call ABI as seen by the kernel core.
//!
//! Everything in this crate is a plain value type that user space and the kernel
//! exchange through registers (the [`SyscallFrame`]) and the thread's [`Utcb`].
//! None of it carries behavior beyond encoding and decoding.

#![cfg_attr(not(test), no_std)]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate static_assertions;

mod error;
mod msg_tag;
mod obj_ref;
mod sched_param;
mod timeout;
mod utcb;

pub use error::*;
pub use msg_tag::*;
pub use obj_ref::*;
pub use sched_param::*;
pub use timeout::*;
pub use utcb::*;

/// A machine word.
pub type Mword = usize;
/// A signed machine word.
pub type Smword = isize;

const_assert_eq!(core::mem::size_of::<Mword>(), 8);

/// Protocol labels carried in the upper bits of a [`MsgTag`].
///
/// Kernel objects use negative labels; user-level protocols use positive ones.
pub mod label {
    use super::Smword;

    pub const NONE: Smword = 0;
    pub const ALLOW_SYSCALL: Smword = 1;
    pub const IRQ: Smword = -1;
    pub const PAGE_FAULT: Smword = -2;
    pub const PREEMPTION: Smword = -3;
    pub const SYS_EXCEPTION: Smword = -4;
    pub const EXCEPTION: Smword = -5;
    pub const SIGMA0: Smword = -6;
    pub const IO_PAGE_FAULT: Smword = -8;
    pub const KOBJECT: Smword = -10;
    pub const TASK: Smword = -11;
    pub const THREAD: Smword = -12;
    pub const LOG: Smword = -13;
    pub const SCHEDULER: Smword = -14;
    pub const FACTORY: Smword = -15;
    pub const VM: Smword = -16;
    pub const DMA_SPACE: Smword = -17;
    pub const IRQ_SENDER: Smword = -18;
    pub const IRQ_MUX: Smword = -19;
    pub const SEMAPHORE: Smword = -20;
    pub const IOMMU: Smword = -22;
    pub const DEBUGGER: Smword = -23;
}
