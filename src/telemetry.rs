//! Best-effort latency and outcome events for public operations.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Public operation an event belongs to.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApiMethod {
    /// `load`.
    LoadSdk,
    /// `unload`.
    UnloadSdk,
    /// `request_surface_package`.
    RequestSurfacePackage,
    /// `list_loaded_sdks`.
    ListLoadedSdks,
    /// `add_death_observer`.
    AddDeathObserver,
    /// `sync_data_from_client`.
    SyncDataFromClient,
}

/// Step within an operation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Whole operation, from call to result.
    Total,
    /// Time until the worker connection resolved.
    Connect,
    /// Remote call to the worker.
    Remote,
}

/// One telemetry sample.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApiEvent {
    /// Operation.
    pub method: ApiMethod,
    /// Step within the operation.
    pub stage: Stage,
    /// Elapsed wall time.
    pub latency: Duration,
    /// Whether the step succeeded.
    pub success: bool,
    /// Caller uid.
    pub uid: u32,
}

/// Receiver of telemetry samples.
///
/// Implementations must return promptly and never fail; the broker does not
/// wait on or inspect the outcome.
pub trait TelemetrySink: Send + Sync {
    /// Record one sample.
    fn record(&self, event: ApiEvent);
}

/// Sink that forwards samples to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: ApiEvent) {
        debug!(
            method = ?event.method,
            stage = ?event.stage,
            latency_ms = u64::try_from(event.latency.as_millis()).unwrap_or(u64::MAX),
            success = event.success,
            uid = event.uid,
            "api telemetry"
        );
    }
}
