//! Scheduling configuration.

/// The highest fixed priority. Priorities range from 0 (idle) to this value.
pub const MAX_PRIO: u8 = 255;

/// The number of fixed priority levels.
pub const PRIO_LEVELS: usize = MAX_PRIO as usize + 1;

/// The priority of a newly created context.
pub const DEFAULT_PRIO: u8 = 1;

/// The priority of kernel-internal threads.
pub const KERNEL_PRIO: u8 = 2;

/// The priority of the idle context, which only runs when nothing else is ready.
pub const IDLE_PRIO: u8 = 0;

/// The maximum number of weighted-fair-queueing contexts ready on one CPU.
pub const MAX_WFQ_READY: usize = 1024;

/// The maximum number of CPUs the scheduler manages.
pub const MAX_CPUS: usize = 64;
