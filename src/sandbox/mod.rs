//! Load sessions, per-caller connection brokers, and the coordinator tying
//! them together.
//!
//! The worker process is reached through the collaborator traits declared
//! here. [`crate::worker`] provides the child-process implementation; tests
//! substitute in-memory fakes.

pub mod broker;
pub mod coordinator;
pub mod death;
pub mod session;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::identity::CallingIdentity;
use crate::models::sdk::{
    ClientDataUpdate, LoadRequest, SandboxedSdk, SurfacePackage, SurfaceParams,
};
use crate::{AppError, Result};

/// Boxed `Send` future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Shared handle to an established worker connection.
pub type ConnectionHandle = Arc<dyn SandboxConnection>;

// ── Remote errors ────────────────────────────────────────────────────────────

/// Error code reported by the worker for a rejected call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorCode {
    /// The sdk is already loaded in this worker.
    AlreadyLoaded,
    /// The sdk or its code could not be found by the worker.
    NotFound,
    /// The sdk provider failed to initialize.
    ProviderInit,
    /// The sdk provider class could not be instantiated.
    Instantiation,
    /// The sdk itself reported an error.
    SdkDefined,
    /// Worker-internal failure.
    Internal,
    /// A code this broker does not recognize.
    #[serde(other)]
    Unknown,
}

/// Rejection reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerError {
    /// Machine-readable code.
    pub code: WorkerErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Failure of a call into the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The worker died or its connection closed.
    Dead,
    /// Transport failure not attributable to death.
    Transport(String),
    /// The worker answered with an error.
    Rejected(WorkerError),
}

impl RemoteError {
    /// Convert into the caller-visible error for a load call.
    #[must_use]
    pub fn into_load_error(self) -> AppError {
        match self {
            Self::Dead => AppError::ProcessUnavailable("sandbox process died during load".into()),
            Self::Transport(msg) => AppError::RemoteInvocation(msg),
            Self::Rejected(err) => match err.code {
                WorkerErrorCode::AlreadyLoaded => AppError::SessionConflict(err.message),
                WorkerErrorCode::NotFound => AppError::SdkNotFound(err.message),
                WorkerErrorCode::SdkDefined => AppError::SdkDefined(err.message),
                WorkerErrorCode::ProviderInit
                | WorkerErrorCode::Instantiation
                | WorkerErrorCode::Internal
                | WorkerErrorCode::Unknown => AppError::Internal(err.message),
            },
        }
    }

    /// Whether the worker failed to instantiate the sdk and should be stopped.
    #[must_use]
    pub fn is_instantiation_failure(&self) -> bool {
        matches!(
            self,
            Self::Rejected(WorkerError {
                code: WorkerErrorCode::Instantiation,
                ..
            })
        )
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dead => write!(f, "worker is dead"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Rejected(err) => write!(f, "rejected ({:?}): {}", err.code, err.message),
        }
    }
}

impl std::error::Error for RemoteError {}

// ── Worker-side handles ──────────────────────────────────────────────────────

/// Link from the worker to one loaded sdk.
pub trait SdkLink: Send + Sync {
    /// Ask the sdk for a renderable surface.
    fn request_surface_package(
        &self,
        params: SurfaceParams,
    ) -> BoxFuture<'_, std::result::Result<SurfacePackage, RemoteError>>;
}

/// Successful remote load.
#[derive(Clone)]
pub struct LoadedSdk {
    /// Caller-visible handle.
    pub sdk: SandboxedSdk,
    /// Link used for surface requests against this sdk.
    pub link: Arc<dyn SdkLink>,
}

impl fmt::Debug for LoadedSdk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedSdk").field("sdk", &self.sdk).finish_non_exhaustive()
    }
}

/// Service handle of a running worker.
pub trait SandboxConnection: Send + Sync {
    /// Load an sdk into the worker.
    fn load_sdk(
        &self,
        request: LoadRequest,
    ) -> BoxFuture<'_, std::result::Result<LoadedSdk, RemoteError>>;

    /// Unload an sdk from the worker.
    fn unload_sdk(&self, sdk_name: &str) -> BoxFuture<'_, std::result::Result<(), RemoteError>>;

    /// Push client data to the worker.
    fn sync_data(
        &self,
        update: ClientDataUpdate,
    ) -> BoxFuture<'_, std::result::Result<(), RemoteError>>;
}

/// Liveness signals of one worker link.
#[derive(Debug, Clone, Default)]
pub struct WorkerLiveness {
    /// Fires when the worker process is gone.
    pub exited: CancellationToken,
    /// Fires when the connection drops; the process may still be alive.
    pub disconnected: CancellationToken,
}

/// Established connection to a worker plus its liveness signals.
#[derive(Clone)]
pub struct SandboxLink {
    /// Service handle.
    pub connection: ConnectionHandle,
    /// Liveness signals watched by the broker.
    pub liveness: WorkerLiveness,
}

impl fmt::Debug for SandboxLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxLink")
            .field("liveness", &self.liveness)
            .finish_non_exhaustive()
    }
}

/// Starts, binds, and stops worker processes.
pub trait ProcessSupervisor: Send + Sync {
    /// Start the caller's worker (if needed) and connect to it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessUnavailable` when the worker cannot be
    /// started or connected.
    fn start_and_connect(&self, caller: &CallingIdentity) -> BoxFuture<'_, Result<SandboxLink>>;

    /// Stop the caller's worker.
    fn stop(&self, caller: &CallingIdentity) -> BoxFuture<'_, ()>;

    /// Release the binding held on behalf of the caller.
    fn unbind(&self, caller: &CallingIdentity) -> BoxFuture<'_, ()>;

    /// Kill the caller's own process.
    fn kill_caller(&self, caller: &CallingIdentity) -> BoxFuture<'_, ()>;
}
