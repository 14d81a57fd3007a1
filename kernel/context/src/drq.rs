//! Deferred requests (DRQs): work posted to the inbox of another CPU.
//!
//! A CPU never touches the scheduler state of another CPU. Instead it posts a
//! [`DrqRequest`] to the target's [`DrqInbox`], which the target drains at its
//! next switch point or tick. `S` is the per-CPU scheduler type the request
//! runs against.

use crate::{ContextRef, ThreadState};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use queue::{Queue, QueueItem, Queued};
use spin::Mutex;
use timeout::TimeoutRef;

pub enum DrqRequest<S> {
    /// Clears `del` and sets `add` in the state of `ctx`, deblocking it if it became ready.
    StateChange {
        ctx: ContextRef,
        del: ThreadState,
        add: ThreadState,
    },
    /// Finishes moving `ctx` to the target CPU and re-arms its timeout there.
    Migrate {
        ctx: ContextRef,
        timeout: Option<TimeoutRef>,
    },
    /// Runs a closure on the target CPU.
    Call(Box<dyn FnOnce(&mut S) + Send>),
}

impl<S> DrqRequest<S> {
    /// The context this request acts on, if any.
    pub fn context(&self) -> Option<&ContextRef> {
        match self {
            DrqRequest::StateChange { ctx, .. } | DrqRequest::Migrate { ctx, .. } => Some(ctx),
            DrqRequest::Call(_) => None,
        }
    }
}

impl<S> fmt::Debug for DrqRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrqRequest::StateChange { ctx, del, add } => {
                write!(f, "StateChange({}, -{} +{})", ctx.name(), del, add)
            }
            DrqRequest::Migrate { ctx, timeout } => {
                write!(f, "Migrate({}, timeout: {})", ctx.name(), timeout.is_some())
            }
            DrqRequest::Call(_) => write!(f, "Call"),
        }
    }
}

/// One queued request.
pub struct Drq<S> {
    item: QueueItem,
    request: Mutex<Option<DrqRequest<S>>>,
}

impl<S> Drq<S> {
    /// Wraps `request`, counting it as pending on the context it names.
    pub fn new(request: DrqRequest<S>) -> Arc<Drq<S>> {
        if let Some(ctx) = request.context() {
            ctx.drq_posted();
        }
        Arc::new(Drq {
            item: QueueItem::new(),
            request: Mutex::new(Some(request)),
        })
    }

    /// Takes the request out; only the first caller gets it.
    ///
    /// The caller is responsible for calling [`Context::drq_handled()`](crate::Context::drq_handled)
    /// once it is done with a request that names a context.
    pub fn take(&self) -> Option<DrqRequest<S>> {
        self.request.lock().take()
    }
}

impl<S> Queued for Drq<S> {
    fn queue_item(&self) -> &QueueItem {
        &self.item
    }
}

/// The inbox of one CPU.
pub type DrqInbox<S> = Queue<Drq<S>>;
