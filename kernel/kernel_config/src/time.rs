//! Timer and timeout configuration. All durations are in microseconds.

/// The period of the scheduler's timer tick.
/// The system clock in the KIP advances by this much on every tick.
pub const SCHEDULER_GRANULARITY_US: u64 = 1000;

/// The quantum given to a `SchedContext` that did not ask for a specific one.
pub const DEFAULT_TIME_SLICE_US: u64 = 10 * SCHEDULER_GRANULARITY_US;

/// Number of hashed buckets in a per-CPU timeout queue, must be a power of two.
pub const TIMEOUT_QUEUE_COUNT: usize = 8;

/// Distance between two timeout buckets, as a power of two (i.e. `1 << 12` us).
pub const TIMEOUT_QUEUE_DISTANCE: u32 = 12;

/// In one-shot mode, the timer is never programmed further out than this.
pub const ONE_SHOT_MAX_IDLE_US: u64 = 10_000;

cfg_if::cfg_if! {
    if #[cfg(feature = "one_shot")] {
        /// Whether the timer is programmed for the next pending timeout.
        pub const SCHEDULER_ONE_SHOT: bool = true;
    } else {
        /// Whether the timer is programmed for the next pending timeout.
        pub const SCHEDULER_ONE_SHOT: bool = false;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "fine_grained_cputime")] {
        /// Whether consumed time is charged from clock deltas on each switch.
        pub const FINE_GRAINED_CPUTIME: bool = true;
    } else {
        /// Whether consumed time is charged from clock deltas on each switch.
        pub const FINE_GRAINED_CPUTIME: bool = false;
    }
}
