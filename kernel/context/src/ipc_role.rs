//! The per-context bookkeeping of the IPC path.
//!
//! An IPC operation that cannot complete right away leaves an [`IpcWait`] behind.
//! When the context is switched to again, the IPC path resumes at the recorded
//! [`IpcPhase`] instead of returning to user level.

use crate::Context;
use abi::{Mword, MsgTag, Rights, TimeoutPair};
use queue::Queue;
use alloc::sync::{Arc, Weak};

/// The outcome of offering a message to a receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckSender {
    /// The receiver accepts the message now.
    Ok,
    /// The sender was put on the receiver's sender list.
    Queued,
    /// The message was transferred already (by the receiver's CPU).
    Done,
    /// The send failed; the error is in the sender's UTCB.
    Failed,
}

/// Where a blocked IPC operation resumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IpcPhase {
    /// No IPC operation is pending.
    #[default]
    Idle,
    /// Waiting for the receiver's CPU to answer a remote handshake.
    RemoteSend,
    /// Queued on the receiver's sender list.
    SendWait,
    /// A send abort raced with the receiver taking the message.
    AbortWait,
    /// The send phase is done and the CPU went to the receiver; the receive phase has not started.
    Receive,
    /// Asleep in the receive phase.
    ReceiveWait,
    /// Asleep on a kernel wait list other than a sender list, e.g., a semaphore's.
    QueueWait,
    /// Waiting for a closure posted to another CPU; it commits the result itself.
    RemoteCall,
    /// Only the result remains to be committed.
    Finish,
}

/// What a pending IPC operation needs to resume.
#[derive(Clone)]
pub struct IpcWait {
    pub phase: IpcPhase,
    /// The tag of the message being sent.
    pub tag: MsgTag,
    pub send_partner: Option<Weak<Context>>,
    pub send_rights: Rights,
    /// The label delivered to the receiver.
    pub label: Mword,
    /// Whether a receive phase follows the send phase.
    pub have_receive: bool,
    /// Whether the receive phase only accepts the sender named in [`IpcRole::partner`].
    pub closed_wait: bool,
    pub timeout: TimeoutPair,
    /// Whether the sender asked to switch to the receiver directly.
    pub do_switch: bool,
    /// The answer of the receiver's CPU to a remote handshake.
    pub remote_result: Option<CheckSender>,
    /// The wait list of a [`IpcPhase::QueueWait`].
    pub wait_queue: Option<Arc<Queue<Context>>>,
}

impl Default for IpcWait {
    fn default() -> IpcWait {
        IpcWait {
            phase: IpcPhase::Idle,
            tag: MsgTag::default(),
            send_partner: None,
            send_rights: Rights::empty(),
            label: 0,
            have_receive: false,
            closed_wait: false,
            timeout: TimeoutPair::NEVER,
            do_switch: false,
            remote_result: None,
            wait_queue: None,
        }
    }
}

impl IpcWait {
    pub fn send_partner(&self) -> Option<Arc<Context>> {
        self.send_partner.as_ref().and_then(Weak::upgrade)
    }
}

/// The sender and receiver roles of a context.
#[derive(Default)]
pub struct IpcRole {
    /// The sender a closed wait waits for, or the sender an open wait picked.
    pub partner: Option<Weak<Context>>,
    /// The reply capability: who called us, with which rights.
    pub caller: Option<(Weak<Context>, Rights)>,
    pub wait: IpcWait,
}
