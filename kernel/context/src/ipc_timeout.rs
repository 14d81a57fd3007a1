use crate::{Context, ThreadState};
use alloc::sync::Weak;
use timeout::{ExpiryContext, Timeout, TimeoutState};

/// The timeout a context arms while it waits in an IPC send or receive phase.
///
/// Every context embeds exactly one.
pub struct IpcTimeout {
    state: TimeoutState,
    owner: Weak<Context>,
}

impl IpcTimeout {
    pub(crate) fn new(owner: Weak<Context>) -> IpcTimeout {
        IpcTimeout { state: TimeoutState::new(), owner }
    }
}

impl Timeout for IpcTimeout {
    fn timeout_state(&self) -> &TimeoutState {
        &self.state
    }

    /// Wakes the owner with `TIMEOUT` set, unless it is no longer waiting.
    fn expired(&self, cx: &mut ExpiryContext<'_>) -> bool {
        let owner = match self.owner.upgrade() {
            Some(owner) => owner,
            None => return false,
        };
        let state = owner.state();
        if state.contains(ThreadState::READY)
            || !state.intersects(ThreadState::IPC_MASK)
            || state.contains(ThreadState::RECEIVE_IN_PROGRESS)
        {
            return false;
        }

        owner.state_add_dirty(ThreadState::READY | ThreadState::TIMEOUT);
        owner.take_timeout();
        debug!("IPC timeout of {} hit at {}", owner.name(), cx.clock);
        cx.rq.deblock(owner.sched(), cx.running.as_ref(), false)
    }
}

impl Drop for IpcTimeout {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.take_timeout();
        }
    }
}
