use crate::Utcb;
use core::fmt;

/// An IPC timeout in the 16-bit L4 encoding.
///
/// A relative timeout is `man << exp` microseconds. The raw value 0 means never,
/// and a zero mantissa means an immediate timeout. With the absolute bit set,
/// the low bits select a buffer register of the UTCB holding an absolute clock value.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct L4Timeout(u16);

impl L4Timeout {
    const MAN_MASK: u16 = 0x3ff;
    const EXP_MASK: u16 = 0x7c00;
    const EXP_SHIFT: u32 = 10;
    const ABS_MASK: u16 = 0x8000;
    const ABS_BUF_MASK: u16 = 0x3f;

    pub const NEVER: L4Timeout = L4Timeout(0);
    pub const ZERO: L4Timeout = L4Timeout(0x400);

    pub const fn new(man: u16, exp: u16) -> L4Timeout {
        L4Timeout((man & Self::MAN_MASK) | ((exp << Self::EXP_SHIFT) & Self::EXP_MASK))
    }

    /// An absolute timeout whose clock value is stored in UTCB buffer register `buf`.
    pub const fn absolute(buf: u16) -> L4Timeout {
        L4Timeout(Self::ABS_MASK | (buf & Self::ABS_BUF_MASK))
    }

    /// Encodes a relative timeout of (roughly) `us` microseconds, rounding down.
    pub fn from_us(us: u64) -> L4Timeout {
        if us == 0 {
            return Self::ZERO;
        }
        let mut exp = 0;
        let mut man = us;
        while man > Self::MAN_MASK as u64 && exp < 31 {
            man >>= 1;
            exp += 1;
        }
        L4Timeout::new(man as u16, exp)
    }

    pub const fn from_raw(raw: u16) -> L4Timeout {
        L4Timeout(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    pub const fn man(&self) -> u16 {
        self.0 & Self::MAN_MASK
    }

    pub const fn exp(&self) -> u16 {
        (self.0 & Self::EXP_MASK) >> Self::EXP_SHIFT
    }

    pub const fn is_never(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    pub const fn is_finite(&self) -> bool {
        self.0 != 0
    }

    pub const fn is_absolute(&self) -> bool {
        self.0 & Self::ABS_MASK != 0
    }

    /// The absolute wakeup time of a relative timeout given the current clock.
    ///
    /// A zero mantissa yields 0, i.e., a point in time that has always passed.
    pub fn microsecs_rel(&self, clock: u64) -> u64 {
        if self.man() == 0 {
            0
        } else {
            clock + ((self.man() as u64) << self.exp())
        }
    }

    /// The absolute wakeup time, reading absolute timeouts from the UTCB.
    pub fn microsecs(&self, clock: u64, utcb: &Utcb) -> u64 {
        if self.is_absolute() {
            let idx = core::cmp::min((self.0 & Self::ABS_BUF_MASK) as usize, Utcb::MAX_BUFFERS - 1);
            utcb.buffers[idx] as u64
        } else {
            self.microsecs_rel(clock)
        }
    }
}

impl fmt::Debug for L4Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "L4Timeout(never)")
        } else if self.is_absolute() {
            write!(f, "L4Timeout(abs br{})", self.0 & Self::ABS_BUF_MASK)
        } else {
            write!(f, "L4Timeout({}<<{})", self.man(), self.exp())
        }
    }
}

/// The receive and send timeouts of one IPC: receive in the low 16 bits, send above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeoutPair {
    pub rcv: L4Timeout,
    pub snd: L4Timeout,
}

impl TimeoutPair {
    pub const NEVER: TimeoutPair = TimeoutPair { rcv: L4Timeout::NEVER, snd: L4Timeout::NEVER };

    pub const fn new(rcv: L4Timeout, snd: L4Timeout) -> TimeoutPair {
        TimeoutPair { rcv, snd }
    }

    pub const fn from_raw(raw: usize) -> TimeoutPair {
        TimeoutPair {
            rcv: L4Timeout::from_raw(raw as u16),
            snd: L4Timeout::from_raw((raw >> 16) as u16),
        }
    }

    pub const fn raw(&self) -> usize {
        self.rcv.raw() as usize | (self.snd.raw() as usize) << 16
    }
}
