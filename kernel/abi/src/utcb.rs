use crate::{L4Error, Mword, MsgTag, ObjRef, TimeoutPair};

/// The user-level thread control block: message, buffer and control registers.
#[derive(Clone)]
#[repr(C)]
pub struct Utcb {
    /// The message registers.
    pub values: [Mword; Utcb::MAX_WORDS],
    pub buf_desc: Mword,
    /// The buffer registers. Also hold absolute timeout values.
    pub buffers: [Mword; Utcb::MAX_BUFFERS],
    /// The IPC error of the last operation that returned a tag with the error flag.
    pub error: L4Error,
    pub user: [Mword; 3],
}

impl Utcb {
    pub const MAX_WORDS: usize = 63;
    pub const MAX_BUFFERS: usize = 58;

    pub const fn new() -> Utcb {
        Utcb {
            values: [0; Utcb::MAX_WORDS],
            buf_desc: 0,
            buffers: [0; Utcb::MAX_BUFFERS],
            error: L4Error::None,
            user: [0; 3],
        }
    }
}

impl Default for Utcb {
    fn default() -> Utcb {
        Utcb::new()
    }
}

/// The register-passed part of a system call.
///
/// On entry it holds the caller's tag, timeouts and invoked capability;
/// on exit the result tag and the label of the sender (`from`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SyscallFrame {
    tag: MsgTag,
    from: Mword,
    timeout: TimeoutPair,
    obj_ref: ObjRef,
}

impl SyscallFrame {
    pub fn new(tag: MsgTag, obj_ref: ObjRef, timeout: TimeoutPair) -> SyscallFrame {
        SyscallFrame { tag, from: 0, timeout, obj_ref }
    }

    pub fn tag(&self) -> MsgTag {
        self.tag
    }

    pub fn set_tag(&mut self, tag: MsgTag) {
        self.tag = tag;
    }

    /// The label of the sender, valid after a completed receive phase.
    pub fn from(&self) -> Mword {
        self.from
    }

    pub fn set_from(&mut self, label: Mword) {
        self.from = label;
    }

    pub fn timeout(&self) -> TimeoutPair {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: TimeoutPair) {
        self.timeout = timeout;
    }

    pub fn obj_ref(&self) -> ObjRef {
        self.obj_ref
    }

    pub fn set_obj_ref(&mut self, obj_ref: ObjRef) {
        self.obj_ref = obj_ref;
    }
}
