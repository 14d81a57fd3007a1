//! Kernel memory configuration.

/// The size of each context's kernel stack.
/// Must be a power of two: stacks are aligned to their size so that the
/// owner of any stack address can be found by masking.
pub const KERNEL_STACK_SIZE: usize = 8 * 1024;

/// The number of bytes charged to a `RamQuota` for one context,
/// i.e. the kernel stack plus the context's bookkeeping.
pub const CONTEXT_QUOTA_SIZE: usize = KERNEL_STACK_SIZE + 1024;

/// The number of bytes charged to a `RamQuota` for one IPC gate or semaphore.
pub const KOBJECT_QUOTA_SIZE: usize = 256;

/// The number of memory descriptors the kernel info page has room for.
pub const KIP_MEM_DESCS: usize = 32;

const _: () = assert!(KERNEL_STACK_SIZE.is_power_of_two());
