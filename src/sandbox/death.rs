//! Sandbox death notifications delivered to registered observers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Registration handle returned by `add_death_observer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Broadcast to a caller's observers when its worker dies.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SandboxDeathEvent {
    /// Caller uid.
    pub uid: u32,
    /// Caller package.
    pub package_name: String,
    /// Sdks that were loaded when the worker died.
    pub unloaded_sdks: Vec<String>,
    /// When the death was processed.
    pub occurred_at: DateTime<Utc>,
}

/// Sending half held for each registered observer.
pub type DeathObserver = mpsc::UnboundedSender<SandboxDeathEvent>;
