use crate::{Mword, MsgTag, Smword, TagFlags, Utcb};

/// The IPC error word stored in the UTCB when a tag carries the error flag.
///
/// Bit 0 tells which phase failed: clear for the send phase, set for the receive phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(usize)]
pub enum L4Error {
    #[default]
    None       = 0,
    Timeout    = 2,
    RTimeout   = 3,
    NotExistent = 4,
    Canceled   = 6,
    RCanceled  = 7,
    Overflow   = 8,
    ROverflow  = 9,
    Aborted    = 14,
    RAborted   = 15,
}

impl L4Error {
    const RCV: Mword = 1;

    pub fn from_raw(raw: Mword) -> Option<L4Error> {
        Some(match raw {
            0 => L4Error::None,
            2 => L4Error::Timeout,
            3 => L4Error::RTimeout,
            4 => L4Error::NotExistent,
            6 => L4Error::Canceled,
            7 => L4Error::RCanceled,
            8 => L4Error::Overflow,
            9 => L4Error::ROverflow,
            14 => L4Error::Aborted,
            15 => L4Error::RAborted,
            _ => return None,
        })
    }

    pub fn raw(self) -> Mword {
        self as Mword
    }

    pub fn ok(self) -> bool {
        self == L4Error::None
    }

    /// Whether the error happened in the receive phase.
    pub fn is_receive_phase(self) -> bool {
        self.raw() & Self::RCV != 0
    }
}

/// Error codes returned by kernel objects, as the negated protocol of the result tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(isize)]
pub enum ErrorCode {
    EPerm         = 1,
    ENoent        = 2,
    ENomem        = 12,
    EFault        = 14,
    EBusy         = 16,
    EExists       = 17,
    ENodev        = 19,
    EInval        = 22,
    ERange        = 34,
    ENosys        = 38,
    EBadproto     = 39,
    EAddrnotavail = 99,
    EMsgtooshort  = 1001,
}

impl ErrorCode {
    pub fn code(self) -> Smword {
        self as Smword
    }

    /// The result tag reporting this error.
    pub fn result(self) -> MsgTag {
        commit_result(-self.code())
    }
}

/// Builds the result tag of a kernel-object operation: `result` becomes the protocol.
pub fn commit_result(result: Smword) -> MsgTag {
    commit_result_words(result, 0)
}

/// Like [`commit_result()`], with `words` reply words in the UTCB.
pub fn commit_result_words(result: Smword, words: usize) -> MsgTag {
    MsgTag::new(words, 0, TagFlags::empty(), result)
}

/// Records an IPC error in the UTCB and returns `tag` with the error flag set.
pub fn commit_error(utcb: &mut Utcb, err: L4Error, tag: MsgTag) -> MsgTag {
    utcb.error = err;
    tag.with_flags(TagFlags::ERROR)
}
