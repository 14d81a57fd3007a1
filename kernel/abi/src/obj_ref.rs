use crate::Mword;
use core::fmt;

bitflags! {
    /// The IPC operation encoded in the low bits of a capability selector.
    pub struct IpcOp: Mword {
        /// Include a send phase.
        const SEND      = 1;
        /// Include a receive phase.
        const RECV      = 2;
        /// Receive from any sender instead of the invoked object.
        const OPEN_WAIT = 4;
        /// Send to the reply capability of the caller.
        const REPLY     = 8;

        const CALL           = Self::SEND.bits | Self::RECV.bits;
        const WAIT           = Self::OPEN_WAIT.bits | Self::RECV.bits;
        const SEND_AND_WAIT  = Self::OPEN_WAIT.bits | Self::SEND.bits | Self::RECV.bits;
        const REPLY_AND_WAIT = Self::OPEN_WAIT.bits | Self::SEND.bits | Self::RECV.bits | Self::REPLY.bits;
    }
}

bitflags! {
    /// Rights on an object capability.
    pub struct Rights: u8 {
        /// Object-specific write right.
        const CW = 0x1;
        /// Strong semantics; missing on an IPC gate demotes transferred capabilities.
        const CS = 0x2;
        /// Read right; without it the capability is not present.
        const CR = 0x4;
        /// Delete right.
        const CD = 0x8;

        const CRW   = Self::CR.bits | Self::CW.bits;
        const CRWSD = Self::CR.bits | Self::CW.bits | Self::CS.bits | Self::CD.bits;
    }
}

impl Rights {
    /// The rights that an IPC gate ORs into the label it delivers.
    pub const LABEL_MASK: Rights = Rights { bits: Self::CS.bits | Self::CW.bits };
}

/// A capability selector as passed from user space.
///
/// The capability index lives above bit 12; the low four bits hold the [`IpcOp`].
/// Selectors with bit 11 set are special and refer to the invoking thread itself.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjRef(Mword);

impl ObjRef {
    const CAP_SHIFT: u32 = 12;
    const SPECIAL_BIT: Mword = 1 << 11;
    const OP_MASK: Mword = 0xf;

    pub const INVALID: ObjRef = ObjRef(Self::SPECIAL_BIT);
    pub const SELF: ObjRef = ObjRef(!0 << 11);

    pub const fn new(cap: usize, op: IpcOp) -> ObjRef {
        ObjRef((cap << Self::CAP_SHIFT) | (op.bits() & Self::OP_MASK))
    }

    /// A reference to the invoking thread with the given operation.
    pub const fn self_ref(op: IpcOp) -> ObjRef {
        ObjRef(Self::SELF.0 | (op.bits() & Self::OP_MASK))
    }

    pub const fn from_raw(raw: Mword) -> ObjRef {
        ObjRef(raw)
    }

    pub const fn raw(&self) -> Mword {
        self.0
    }

    /// Whether this selector indexes the capability table.
    pub const fn valid(&self) -> bool {
        self.0 & Self::SPECIAL_BIT == 0
    }

    pub const fn special(&self) -> bool {
        !self.valid()
    }

    pub const fn is_self(&self) -> bool {
        self.special()
    }

    pub const fn cap(&self) -> usize {
        self.0 >> Self::CAP_SHIFT
    }

    pub const fn op(&self) -> IpcOp {
        IpcOp::from_bits_truncate(self.0 & Self::OP_MASK)
    }

    pub const fn have_recv(&self) -> bool {
        self.0 & IpcOp::RECV.bits() != 0
    }
}

impl Default for ObjRef {
    fn default() -> ObjRef {
        ObjRef::INVALID
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "ObjRef(cap {}, {:?})", self.cap(), self.op())
        } else {
            write!(f, "ObjRef(self, {:?})", self.op())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_and_op() {
        let r = ObjRef::new(7, IpcOp::CALL);
        assert!(r.valid());
        assert_eq!(r.cap(), 7);
        assert_eq!(r.op(), IpcOp::CALL);
        assert!(r.have_recv());

        let s = ObjRef::self_ref(IpcOp::WAIT);
        assert!(s.is_self());
        assert_eq!(s.op(), IpcOp::WAIT);
        assert!(ObjRef::INVALID.special());
    }
}
