use crate::{Mword, Smword};
use core::fmt;

bitflags! {
    /// The flag bits of a message tag.
    pub struct TagFlags: Mword {
        /// Transfer the FPU state along with the message.
        const TRANSFER_FPU = 0x1000;
        /// Make a scheduling decision instead of switching directly to the partner.
        const SCHEDULE     = 0x2000;
        /// Propagate the reply capability (send only).
        const PROPAGATE    = 0x4000;
        /// Set by the kernel when the operation failed; details are in the UTCB error word.
        const ERROR        = 0x8000;
    }
}

/// The message tag: word and item counts, flags and the protocol label.
///
/// Bits 0..6 hold the untyped word count, bits 6..12 the typed item count,
/// bits 12..16 the [`TagFlags`], and everything above bit 16 the (signed) protocol.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct MsgTag(Mword);

impl MsgTag {
    const WORDS_MASK: Mword = 0x3f;
    const ITEMS_SHIFT: u32 = 6;
    const FLAGS_MASK: Mword = 0xf000;
    const PROTO_SHIFT: u32 = 16;

    pub const fn new(words: usize, items: usize, flags: TagFlags, proto: Smword) -> MsgTag {
        MsgTag(
            (words & Self::WORDS_MASK)
                | ((items & Self::WORDS_MASK) << Self::ITEMS_SHIFT)
                | (flags.bits() & Self::FLAGS_MASK)
                | ((proto as Mword) << Self::PROTO_SHIFT),
        )
    }

    pub const fn from_raw(raw: Mword) -> MsgTag {
        MsgTag(raw)
    }

    pub const fn raw(&self) -> Mword {
        self.0
    }

    /// The number of untyped message words.
    pub const fn words(&self) -> usize {
        self.0 & Self::WORDS_MASK
    }

    /// The number of typed message items.
    pub const fn items(&self) -> usize {
        (self.0 >> Self::ITEMS_SHIFT) & Self::WORDS_MASK
    }

    pub const fn flags(&self) -> TagFlags {
        TagFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// The protocol, also called the label.
    pub const fn proto(&self) -> Smword {
        (self.0 as Smword) >> Self::PROTO_SHIFT
    }

    pub const fn has_error(&self) -> bool {
        self.0 & TagFlags::ERROR.bits() != 0
    }

    /// Whether the sender asked to switch directly to the receiver
    /// instead of going through the scheduler.
    pub const fn do_switch(&self) -> bool {
        self.0 & TagFlags::SCHEDULE.bits() == 0
    }

    pub const fn transfer_fpu(&self) -> bool {
        self.0 & TagFlags::TRANSFER_FPU.bits() != 0
    }

    /// Returns a copy of this tag with the given flags added.
    pub const fn with_flags(self, flags: TagFlags) -> MsgTag {
        MsgTag(self.0 | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns a copy of this tag with the given flags removed.
    pub const fn without_flags(self, flags: TagFlags) -> MsgTag {
        MsgTag(self.0 & !(flags.bits() & Self::FLAGS_MASK))
    }
}

impl fmt::Debug for MsgTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MsgTag(proto: {}, words: {}, items: {}, flags: {:?})",
            self.proto(), self.words(), self.items(), self.flags()
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::label;

    #[test]
    fn fields_are_packed() {
        let tag = MsgTag::new(3, 1, TagFlags::SCHEDULE, label::THREAD);
        assert_eq!(tag.words(), 3);
        assert_eq!(tag.items(), 1);
        assert_eq!(tag.proto(), -12);
        assert!(!tag.do_switch());
        assert!(!tag.has_error());

        let err = tag.with_flags(TagFlags::ERROR);
        assert!(err.has_error());
        assert_eq!(err.proto(), -12);
        assert!(!err.without_flags(TagFlags::ERROR).has_error());
    }

    #[test]
    fn words_are_masked() {
        let tag = MsgTag::new(70, 0, TagFlags::empty(), 5);
        assert_eq!(tag.words(), 70 & 0x3f);
        assert_eq!(tag.items(), 0);
        assert_eq!(tag.proto(), 5);
        assert!(tag.do_switch());
    }
}
