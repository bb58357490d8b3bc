//! One-shot result callbacks handed in by callers.
//!
//! A [`Callback`] wraps a [`oneshot::Sender`]; [`Callback::resolve`] consumes
//! it, so a callback can be delivered at most once. Every callback carries a
//! process-unique [`CallbackId`] so pending callbacks can be tracked in maps
//! without comparing channel handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::debug;

use crate::models::sdk::{SandboxedSdk, SurfacePackage};
use crate::Result;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a single callback instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Receiving half of a [`Callback`].
pub type CallbackReceiver<T> = oneshot::Receiver<Result<T>>;

/// Result callback for a load request.
pub type LoadCallback = Callback<SandboxedSdk>;

/// Result callback for a surface-package request.
pub type SurfaceCallback = Callback<SurfacePackage>;

/// At-most-once result delivery capability.
pub struct Callback<T> {
    id: CallbackId,
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Callback<T> {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(tx: oneshot::Sender<Result<T>>) -> Self {
        Self {
            id: CallbackId::next(),
            tx,
        }
    }

    /// Identifier of this callback.
    #[must_use]
    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Whether the receiving side has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Deliver the result. A dropped receiver is logged, never an error.
    pub fn resolve(self, result: Result<T>) {
        if self.tx.send(result).is_err() {
            debug!(callback_id = %self.id, "callback receiver dropped before delivery");
        }
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("id", &self.id).finish()
    }
}

/// Create a connected callback / receiver pair.
#[must_use]
pub fn channel<T>() -> (Callback<T>, CallbackReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (Callback::new(tx), rx)
}
