//! Load session state machine.
//!
//! ```text
//! LOAD_PENDING ──success──▶ LOADED ──unload / worker death──▶ UNLOADED
//!      │
//!      └──error / connect failure / worker death──▶ LOAD_FAILED
//! ```
//!
//! The first terminal event wins; later results are logged and dropped. The
//! result callback and every surface callback are resolved outside the
//! session lock.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::callback::{CallbackId, LoadCallback, SurfaceCallback};
use crate::models::identity::CallingIdentity;
use crate::models::sdk::{
    Bundle, LoadRequest, SandboxedSdk, SdkProviderInfo, StorageDirs, SurfaceParams,
};
use crate::sandbox::{ConnectionHandle, LoadedSdk, RemoteError};
use crate::{AppError, Result};

/// Lifecycle status of a load session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    /// Waiting for the worker to answer.
    LoadPending,
    /// Loaded in the worker.
    Loaded,
    /// The load did not succeed.
    LoadFailed,
    /// Unloaded explicitly or by worker death.
    Unloaded,
}

impl LoadStatus {
    /// Whether the session blocks a new load of the same sdk.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::LoadPending | Self::Loaded)
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::LoadPending => 0,
            Self::Loaded => 1,
            Self::LoadFailed => 2,
            Self::Unloaded => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::LoadPending,
            1 => Self::Loaded,
            2 => Self::LoadFailed,
            _ => Self::Unloaded,
        }
    }
}

/// Result of driving a session's remote load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The sdk is loaded.
    Loaded,
    /// The load failed or lost a race with worker death.
    Failed,
    /// The worker could not instantiate the sdk and should be stopped.
    SandboxInitFailed,
}

struct SessionState {
    status: LoadStatus,
    load_issued: bool,
    callback: Option<LoadCallback>,
    loaded: Option<LoadedSdk>,
    connection: Option<ConnectionHandle>,
    surface_callbacks: HashMap<CallbackId, SurfaceCallback>,
}

/// One load attempt of one sdk for one caller.
pub struct LoadSession {
    owner: CallingIdentity,
    provider: SdkProviderInfo,
    params: Bundle,
    status: AtomicU8,
    /// Link generation the load was issued over; zero until connected.
    link_generation: AtomicU64,
    state: Mutex<SessionState>,
}

impl LoadSession {
    /// Pending session that will resolve `callback` exactly once.
    #[must_use]
    pub fn new(
        owner: CallingIdentity,
        provider: SdkProviderInfo,
        params: Bundle,
        callback: LoadCallback,
    ) -> Self {
        Self {
            owner,
            provider,
            params,
            status: AtomicU8::new(LoadStatus::LoadPending.as_u8()),
            link_generation: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                status: LoadStatus::LoadPending,
                load_issued: false,
                callback: Some(callback),
                loaded: None,
                connection: None,
                surface_callbacks: HashMap::new(),
            }),
        }
    }

    /// Sdk name.
    #[must_use]
    pub fn sdk_name(&self) -> &str {
        &self.provider.sdk_name
    }

    /// Owning caller.
    #[must_use]
    pub fn owner(&self) -> &CallingIdentity {
        &self.owner
    }

    /// Status without taking the session lock.
    #[must_use]
    pub fn status(&self) -> LoadStatus {
        LoadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the session blocks a new load of the same sdk.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Record the worker link generation the load goes out over.
    pub fn bind_link(&self, generation: u64) {
        self.link_generation.store(generation, Ordering::Release);
    }

    /// Generation of the worker link the session is tied to, once connected.
    #[must_use]
    pub fn link_generation(&self) -> Option<u64> {
        match self.link_generation.load(Ordering::Acquire) {
            0 => None,
            generation => Some(generation),
        }
    }

    /// Caller-visible handle while loaded.
    pub async fn loaded_sdk(&self) -> Option<SandboxedSdk> {
        let state = self.state.lock().await;
        match state.status {
            LoadStatus::Loaded => state.loaded.as_ref().map(|loaded| loaded.sdk.clone()),
            LoadStatus::LoadPending | LoadStatus::LoadFailed | LoadStatus::Unloaded => None,
        }
    }

    /// Number of surface requests awaiting an answer.
    pub async fn pending_surface_requests(&self) -> usize {
        self.state.lock().await.surface_callbacks.len()
    }

    /// Issue the remote load over `connection`.
    ///
    /// An absent connection fails the session with `ProcessUnavailable`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionConflict` if the session is no longer
    /// pending or a load was already issued; the callback is untouched.
    pub async fn load(
        &self,
        connection: Option<ConnectionHandle>,
        storage: StorageDirs,
    ) -> Result<LoadOutcome> {
        {
            let mut state = self.state.lock().await;
            if state.status != LoadStatus::LoadPending || state.load_issued {
                return Err(AppError::SessionConflict(format!(
                    "{} load already issued",
                    self.sdk_name()
                )));
            }
            state.load_issued = true;
        }

        let Some(connection) = connection else {
            self.handle_load_failure(AppError::ProcessUnavailable(
                "sandbox process not available".into(),
            ))
            .await;
            return Ok(LoadOutcome::Failed);
        };

        let request = LoadRequest {
            caller_package: self.owner.package_name().to_owned(),
            provider: self.provider.clone(),
            storage,
            params: self.params.clone(),
        };

        match connection.load_sdk(request).await {
            Ok(loaded) => {
                if self.handle_load_success(loaded, connection).await {
                    Ok(LoadOutcome::Loaded)
                } else {
                    Ok(LoadOutcome::Failed)
                }
            }
            Err(err) => {
                let init_failed = err.is_instantiation_failure();
                self.handle_load_failure(err.into_load_error()).await;
                if init_failed {
                    Ok(LoadOutcome::SandboxInitFailed)
                } else {
                    Ok(LoadOutcome::Failed)
                }
            }
        }
    }

    /// Mark the session loaded and deliver the handle.
    ///
    /// Returns `false` (and changes nothing) if the session already left
    /// `LOAD_PENDING`.
    pub async fn handle_load_success(&self, loaded: LoadedSdk, connection: ConnectionHandle) -> bool {
        let sdk = loaded.sdk.clone();
        let callback = {
            let mut state = self.state.lock().await;
            if state.status != LoadStatus::LoadPending {
                debug!(
                    sdk_name = self.sdk_name(),
                    status = ?state.status,
                    "dropping late load success"
                );
                return false;
            }
            self.set_status(&mut state, LoadStatus::Loaded);
            state.loaded = Some(loaded);
            state.connection = Some(connection);
            state.callback.take()
        };

        info!(
            uid = self.owner.uid(),
            package = self.owner.package_name(),
            sdk_name = self.sdk_name(),
            "sdk loaded"
        );
        if let Some(callback) = callback {
            callback.resolve(Ok(sdk));
        }
        true
    }

    /// Mark the session failed and deliver `error`.
    ///
    /// Returns `false` (and changes nothing) if the session already left
    /// `LOAD_PENDING`.
    pub async fn handle_load_failure(&self, error: AppError) -> bool {
        let callback = {
            let mut state = self.state.lock().await;
            if state.status != LoadStatus::LoadPending {
                debug!(
                    sdk_name = self.sdk_name(),
                    status = ?state.status,
                    %error,
                    "dropping late load failure"
                );
                return false;
            }
            self.set_status(&mut state, LoadStatus::LoadFailed);
            state.callback.take()
        };

        warn!(
            uid = self.owner.uid(),
            package = self.owner.package_name(),
            sdk_name = self.sdk_name(),
            %error,
            "sdk load failed"
        );
        if let Some(callback) = callback {
            callback.resolve(Err(error));
        }
        true
    }

    /// Unload the sdk.
    ///
    /// A failed or unloaded session is left as is. The remote unload is
    /// best-effort; a worker that cannot be reached is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionConflict` while the load is still pending.
    pub async fn unload(&self) -> Result<()> {
        let (connection, drained) = {
            let mut state = self.state.lock().await;
            match state.status {
                LoadStatus::LoadPending => {
                    return Err(AppError::SessionConflict(format!(
                        "{} is still loading",
                        self.sdk_name()
                    )));
                }
                LoadStatus::LoadFailed | LoadStatus::Unloaded => return Ok(()),
                LoadStatus::Loaded => {
                    self.set_status(&mut state, LoadStatus::Unloaded);
                    state.loaded = None;
                    (
                        state.connection.take(),
                        mem::take(&mut state.surface_callbacks),
                    )
                }
            }
        };

        info!(
            uid = self.owner.uid(),
            package = self.owner.package_name(),
            sdk_name = self.sdk_name(),
            "sdk unloaded"
        );
        for callback in drained.into_values() {
            callback.resolve(Err(AppError::SurfacePackageNotLoaded(format!(
                "{} was unloaded",
                self.sdk_name()
            ))));
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.unload_sdk(self.sdk_name()).await {
                debug!(sdk_name = self.sdk_name(), %err, "remote unload failed");
            }
        }
        Ok(())
    }

    /// Ask the loaded sdk for a surface package and resolve `callback` with it.
    ///
    /// The session lock is released for the remote call. If the worker dies
    /// or the sdk is unloaded meanwhile, the callback has already been
    /// resolved and the late answer is dropped. Returns whether a package
    /// was delivered.
    pub async fn request_surface_package(
        &self,
        params: SurfaceParams,
        callback: SurfaceCallback,
    ) -> bool {
        let registered = {
            let mut state = self.state.lock().await;
            let link = state.loaded.as_ref().map(|loaded| Arc::clone(&loaded.link));
            match (state.status, link) {
                (LoadStatus::Loaded, Some(link)) => {
                    let id = callback.id();
                    state.surface_callbacks.insert(id, callback);
                    Ok((id, link))
                }
                _ => Err(callback),
            }
        };

        let (id, link) = match registered {
            Ok(registered) => registered,
            Err(callback) => {
                callback.resolve(Err(AppError::SurfacePackageNotLoaded(format!(
                    "{} is not loaded",
                    self.sdk_name()
                ))));
                return false;
            }
        };

        let result = link.request_surface_package(params).await;

        let Some(callback) = self.state.lock().await.surface_callbacks.remove(&id) else {
            debug!(
                sdk_name = self.sdk_name(),
                callback_id = %id,
                "dropping surface package for resolved request"
            );
            return false;
        };

        let delivered = result.is_ok();
        callback.resolve(result.map_err(|err| match err {
            RemoteError::Dead => AppError::SurfacePackageNotLoaded(format!(
                "sandbox process of {} died",
                self.sdk_name()
            )),
            RemoteError::Transport(msg) => AppError::RemoteInvocation(msg),
            RemoteError::Rejected(rejection) => AppError::Internal(rejection.message),
        }));
        delivered
    }

    /// Apply the death of the worker.
    ///
    /// A pending load fails with `ProcessUnavailable`; a loaded sdk becomes
    /// unloaded. Every outstanding surface request fails.
    pub async fn on_worker_death(&self) {
        let (callback, drained) = {
            let mut state = self.state.lock().await;
            let callback = match state.status {
                LoadStatus::LoadPending => {
                    self.set_status(&mut state, LoadStatus::LoadFailed);
                    state.callback.take()
                }
                LoadStatus::Loaded => {
                    self.set_status(&mut state, LoadStatus::Unloaded);
                    state.loaded = None;
                    state.connection = None;
                    None
                }
                LoadStatus::LoadFailed | LoadStatus::Unloaded => None,
            };
            (callback, mem::take(&mut state.surface_callbacks))
        };

        if let Some(callback) = callback {
            callback.resolve(Err(AppError::ProcessUnavailable(format!(
                "sandbox process died while loading {}",
                self.sdk_name()
            ))));
        }
        for surface in drained.into_values() {
            surface.resolve(Err(AppError::ProcessUnavailable(
                "sandbox process died".into(),
            )));
        }
    }

    fn set_status(&self, state: &mut SessionState, status: LoadStatus) {
        state.status = status;
        self.status.store(status.as_u8(), Ordering::Release);
    }
}
