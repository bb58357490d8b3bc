//! Sandbox lifecycle coordinator.
//!
//! Owns the per-caller table of load sessions, connection brokers, and death
//! observers, exposes the public load / unload / surface operations, and runs
//! the caller-death and worker-death cleanup protocols.
//!
//! Lock discipline: the table lock is held only to look up, insert, or remove
//! entries. Session and broker locks are taken after it is released, and no
//! callback is resolved while any lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::callback::{self, LoadCallback, SurfaceCallback};
use crate::config::BrokerConfig;
use crate::models::identity::CallingIdentity;
use crate::models::sdk::{
    Bundle, ClientDataUpdate, SandboxedSdk, SurfacePackage, SurfaceParams,
};
use crate::packages::{PackageResolver, StaticPackageRegistry};
use crate::sandbox::broker::{
    BrokerConnection, BrokerStatus, LinkObserver, RestartPolicy, SandboxConnectionBroker,
};
use crate::sandbox::death::{DeathObserver, ObserverId, SandboxDeathEvent};
use crate::sandbox::session::{LoadOutcome, LoadSession, LoadStatus};
use crate::sandbox::{BoxFuture, ProcessSupervisor, RemoteError};
use crate::storage::{FsStorageProvider, StorageDirProvider};
use crate::telemetry::{ApiEvent, ApiMethod, Stage, TelemetrySink, TracingTelemetry};
use crate::worker::ChildProcessSupervisor;
use crate::{AppError, Result};

/// Collaborators the coordinator delegates to.
#[derive(Clone)]
pub struct Collaborators {
    /// Installed-package lookup.
    pub packages: Arc<dyn PackageResolver>,
    /// Worker process control.
    pub supervisor: Arc<dyn ProcessSupervisor>,
    /// Sdk data directories.
    pub storage: Arc<dyn StorageDirProvider>,
    /// Telemetry sink.
    pub telemetry: Arc<dyn TelemetrySink>,
}

/// Behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Restart policy handed to every broker.
    pub restart_policy: RestartPolicy,
    /// Kill an unobserved caller whose worker died with sdks loaded.
    pub kill_caller_on_sandbox_death: bool,
    /// Initial kill-switch state.
    pub sandbox_disabled: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::Never,
            kill_caller_on_sandbox_death: true,
            sandbox_disabled: false,
        }
    }
}

impl From<&BrokerConfig> for CoordinatorSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            restart_policy: config.restart_policy(),
            kill_caller_on_sandbox_death: config.kill_caller_on_sandbox_death,
            sandbox_disabled: config.sandbox_disabled,
        }
    }
}

// ── Diagnostics ──────────────────────────────────────────────────────────────

/// Point-in-time dump of coordinator state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    /// Kill-switch state.
    pub sandbox_disabled: bool,
    /// One entry per known caller, ordered by uid then package.
    pub callers: Vec<CallerSnapshot>,
}

/// State of one caller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CallerSnapshot {
    /// Caller uid.
    pub uid: u32,
    /// Caller package.
    pub package_name: String,
    /// Broker status.
    pub broker: BrokerStatus,
    /// Whether a live connection handle is held.
    pub has_connection: bool,
    /// Whether the caller holds a binding.
    pub bound: bool,
    /// Sessions ordered by sdk name.
    pub sessions: Vec<SessionSnapshot>,
    /// Registered death observers.
    pub observer_count: usize,
}

/// State of one session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Sdk name.
    pub sdk_name: String,
    /// Status.
    pub status: LoadStatus,
}

// ── Table ────────────────────────────────────────────────────────────────────

struct CallerEntry {
    /// First identity seen for the caller; carries the process token.
    identity: CallingIdentity,
    broker: Arc<SandboxConnectionBroker>,
    sessions: HashMap<String, Arc<LoadSession>>,
    observers: HashMap<ObserverId, DeathObserver>,
    caller_watch: Option<CancellationToken>,
}

#[derive(Default)]
struct Tables {
    callers: HashMap<CallingIdentity, CallerEntry>,
}

struct CoordinatorInner {
    this: Weak<CoordinatorInner>,
    deps: Collaborators,
    restart_policy: RestartPolicy,
    kill_caller_on_sandbox_death: bool,
    sandbox_disabled: AtomicBool,
    tables: Mutex<Tables>,
}

/// Top-level orchestrator of sdk sandboxes.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SandboxLifecycleCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SandboxLifecycleCoordinator {
    /// Coordinator over the given collaborators.
    #[must_use]
    pub fn new(deps: Collaborators, settings: CoordinatorSettings) -> Self {
        let inner = Arc::new_cyclic(|this| CoordinatorInner {
            this: this.clone(),
            deps,
            restart_policy: settings.restart_policy,
            kill_caller_on_sandbox_death: settings.kill_caller_on_sandbox_death,
            sandbox_disabled: AtomicBool::new(settings.sandbox_disabled),
            tables: Mutex::new(Tables::default()),
        });
        Self { inner }
    }

    /// Coordinator wired to the child-process supervisor, the file-system
    /// storage provider, the configured package table, and tracing telemetry.
    #[must_use]
    pub fn from_config(config: &BrokerConfig) -> Self {
        let deps = Collaborators {
            packages: Arc::new(StaticPackageRegistry::from_entries(&config.packages)),
            supervisor: Arc::new(ChildProcessSupervisor::new(config.worker.clone())),
            storage: Arc::new(FsStorageProvider::new(config.storage.root.clone())),
            telemetry: Arc::new(TracingTelemetry),
        };
        Self::new(deps, CoordinatorSettings::from(config))
    }

    /// Package resolver used for sdk resolution and caller verification.
    #[must_use]
    pub fn packages(&self) -> &dyn PackageResolver {
        self.inner.deps.packages.as_ref()
    }

    /// Verify that `package_name` belongs to `uid`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CallerMismatch` on verification failure.
    pub fn verify_caller(&self, uid: u32, package_name: &str) -> Result<CallingIdentity> {
        CallingIdentity::verify(self.packages(), uid, package_name)
    }

    // ── Load ─────────────────────────────────────────────────────────────────

    /// Start loading `sdk_name` for `caller`; the outcome goes to `callback`.
    ///
    /// Rejections that touch no state (kill switch, unknown sdk, conflicting
    /// session) resolve the callback before this returns. Otherwise a new
    /// pending session is recorded and the load proceeds in the background.
    pub async fn load(
        &self,
        caller: CallingIdentity,
        sdk_name: &str,
        params: Bundle,
        callback: LoadCallback,
    ) {
        let started = Instant::now();
        let inner = &self.inner;

        let reject = |callback: LoadCallback, error: AppError| {
            inner.record(ApiMethod::LoadSdk, Stage::Total, started, false, caller.uid());
            callback.resolve(Err(error));
        };

        if inner.is_sandbox_disabled() {
            reject(callback, AppError::SandboxDisabled("sdk sandbox is disabled".into()));
            return;
        }

        let provider = match inner.deps.packages.resolve_sdk(&caller, sdk_name) {
            Ok(provider) => provider,
            Err(reason) => {
                reject(callback, AppError::SdkNotFound(reason));
                return;
            }
        };

        if caller.process_token().is_some_and(|token| token.has_exited()) {
            inner.on_caller_death(&caller).await;
            reject(callback, AppError::Internal("caller process has already died".into()));
            return;
        }

        let admitted = {
            let mut tables = inner.tables.lock().await;
            let entry = inner.entry_for(&mut tables, &caller);
            if entry
                .sessions
                .get(sdk_name)
                .is_some_and(|existing| existing.is_active())
            {
                Err(callback)
            } else {
                let session = Arc::new(LoadSession::new(caller.clone(), provider, params, callback));
                entry.sessions.insert(sdk_name.to_owned(), Arc::clone(&session));
                Ok((session, Arc::clone(&entry.broker)))
            }
        };

        let (session, broker) = match admitted {
            Ok(admitted) => admitted,
            Err(callback) => {
                debug!(uid = caller.uid(), sdk_name, "rejecting overlapping load");
                reject(
                    callback,
                    AppError::SessionConflict(format!("{sdk_name} is already loaded or loading")),
                );
                return;
            }
        };

        let span = info_span!("load_sdk", uid = caller.uid(), package = caller.package_name(), sdk_name);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move { inner.drive_load(caller, session, broker, started).await }.instrument(span),
        );
    }

    /// Load `sdk_name` and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns whatever error the load resolves with.
    pub async fn load_sdk(
        &self,
        caller: CallingIdentity,
        sdk_name: &str,
        params: Bundle,
    ) -> Result<SandboxedSdk> {
        let (callback, rx) = callback::channel();
        self.load(caller, sdk_name, params, callback).await;
        rx.await
            .map_err(|_| AppError::Internal("load abandoned before completion".into()))?
    }

    // ── Unload ───────────────────────────────────────────────────────────────

    /// Unload `sdk_name` for `caller`.
    ///
    /// Absent, failed, or already unloaded sessions are a no-op. When the
    /// caller has no loaded sdk left its worker is stopped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionConflict` while the load is still pending.
    pub async fn unload(&self, caller: &CallingIdentity, sdk_name: &str) -> Result<()> {
        let started = Instant::now();
        let inner = &self.inner;

        let session = inner
            .tables
            .lock()
            .await
            .callers
            .get(caller)
            .and_then(|entry| entry.sessions.get(sdk_name).cloned());
        let Some(session) = session else {
            debug!(uid = caller.uid(), sdk_name, "unload of unknown sdk ignored");
            return Ok(());
        };

        let result = session.unload().await;
        inner.record(ApiMethod::UnloadSdk, Stage::Total, started, result.is_ok(), caller.uid());
        result?;

        let loaded_left = inner
            .tables
            .lock()
            .await
            .callers
            .get(caller)
            .map_or(0, |entry| {
                entry
                    .sessions
                    .values()
                    .filter(|session| session.status() == LoadStatus::Loaded)
                    .count()
            });
        if loaded_left == 0 {
            inner.stop_sandbox_service(caller, "no sdk left loaded").await;
        }
        Ok(())
    }

    // ── Surface packages ─────────────────────────────────────────────────────

    /// Request a surface package from the loaded `sdk_name`.
    pub async fn request_surface_package(
        &self,
        caller: &CallingIdentity,
        sdk_name: &str,
        params: SurfaceParams,
        callback: SurfaceCallback,
    ) {
        let started = Instant::now();
        let session = self
            .inner
            .tables
            .lock()
            .await
            .callers
            .get(caller)
            .and_then(|entry| entry.sessions.get(sdk_name).cloned());

        let Some(session) = session else {
            self.inner.record(
                ApiMethod::RequestSurfacePackage,
                Stage::Total,
                started,
                false,
                caller.uid(),
            );
            callback.resolve(Err(AppError::SurfacePackageNotLoaded(format!(
                "{sdk_name} is not loaded"
            ))));
            return;
        };

        let inner = Arc::clone(&self.inner);
        let uid = caller.uid();
        tokio::spawn(async move {
            let delivered = session.request_surface_package(params, callback).await;
            inner.record(ApiMethod::RequestSurfacePackage, Stage::Total, started, delivered, uid);
        });
    }

    /// Request a surface package and wait for it.
    ///
    /// # Errors
    ///
    /// Returns whatever error the request resolves with.
    pub async fn request_surface_package_async(
        &self,
        caller: &CallingIdentity,
        sdk_name: &str,
        params: SurfaceParams,
    ) -> Result<SurfacePackage> {
        let (callback, rx) = callback::channel();
        self.request_surface_package(caller, sdk_name, params, callback)
            .await;
        rx.await
            .map_err(|_| AppError::Internal("surface request abandoned".into()))?
    }

    // ── Client data ──────────────────────────────────────────────────────────

    /// Push `update` into `caller`'s running worker.
    ///
    /// Never starts a worker; the caller resends its data after the next load.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessUnavailable` when no worker is connected or
    /// it died during the call, `AppError::RemoteInvocation` on a transport
    /// failure and `AppError::Internal` when the worker rejects the update.
    pub async fn sync_data_from_client(
        &self,
        caller: &CallingIdentity,
        update: ClientDataUpdate,
    ) -> Result<()> {
        let started = Instant::now();
        let connection = match self.inner.broker_of(caller).await {
            Some(broker) => broker.connection().await,
            None => None,
        };
        let Some(connection) = connection else {
            debug!(uid = caller.uid(), "client data sync without a running sandbox");
            self.inner
                .record(ApiMethod::SyncDataFromClient, Stage::Total, started, false, caller.uid());
            return Err(AppError::ProcessUnavailable("sandbox not available".into()));
        };

        let keys = update.keys.len();
        let result = connection.sync_data(update).await.map_err(|err| match err {
            RemoteError::Dead => AppError::ProcessUnavailable("sandbox died during sync".into()),
            RemoteError::Transport(msg) => AppError::RemoteInvocation(msg),
            RemoteError::Rejected(rejection) => AppError::Internal(rejection.message),
        });
        debug!(uid = caller.uid(), keys, ok = result.is_ok(), "client data synced");
        self.inner.record(
            ApiMethod::SyncDataFromClient,
            Stage::Total,
            started,
            result.is_ok(),
            caller.uid(),
        );
        result
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// Sdks currently loaded for `caller`, ordered by name.
    pub async fn list_loaded_sdks(&self, caller: &CallingIdentity) -> Vec<SandboxedSdk> {
        let started = Instant::now();
        let sessions: Vec<Arc<LoadSession>> = self
            .inner
            .tables
            .lock()
            .await
            .callers
            .get(caller)
            .map(|entry| entry.sessions.values().cloned().collect())
            .unwrap_or_default();

        let mut loaded = Vec::new();
        for session in sessions {
            if let Some(sdk) = session.loaded_sdk().await {
                loaded.push(sdk);
            }
        }
        loaded.sort_by(|a, b| a.sdk_name.cmp(&b.sdk_name));
        self.inner
            .record(ApiMethod::ListLoadedSdks, Stage::Total, started, true, caller.uid());
        loaded
    }

    /// Status of the session for `sdk_name`, if one is recorded.
    pub async fn session_status(&self, caller: &CallingIdentity, sdk_name: &str) -> Option<LoadStatus> {
        self.inner
            .tables
            .lock()
            .await
            .callers
            .get(caller)
            .and_then(|entry| entry.sessions.get(sdk_name))
            .map(|session| session.status())
    }

    /// Broker status of `caller`, if the caller is known.
    pub async fn broker_status(&self, caller: &CallingIdentity) -> Option<BrokerStatus> {
        let broker = self.inner.broker_of(caller).await?;
        Some(broker.status().await)
    }

    /// Serializable dump of all callers.
    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let entries: Vec<_> = {
            let tables = self.inner.tables.lock().await;
            tables
                .callers
                .values()
                .map(|entry| {
                    (
                        entry.identity.clone(),
                        Arc::clone(&entry.broker),
                        entry.sessions.values().cloned().collect::<Vec<_>>(),
                        entry.observers.len(),
                    )
                })
                .collect()
        };

        let mut callers = Vec::with_capacity(entries.len());
        for (identity, broker, sessions, observer_count) in entries {
            let mut sessions: Vec<SessionSnapshot> = sessions
                .iter()
                .map(|session| SessionSnapshot {
                    sdk_name: session.sdk_name().to_owned(),
                    status: session.status(),
                })
                .collect();
            sessions.sort_by(|a, b| a.sdk_name.cmp(&b.sdk_name));
            callers.push(CallerSnapshot {
                uid: identity.uid(),
                package_name: identity.package_name().to_owned(),
                broker: broker.status().await,
                has_connection: broker.has_connection().await,
                bound: broker.is_bound().await,
                sessions,
                observer_count,
            });
        }
        callers.sort_by(|a, b| (a.uid, &a.package_name).cmp(&(b.uid, &b.package_name)));

        CoordinatorSnapshot {
            sandbox_disabled: self.inner.is_sandbox_disabled(),
            callers,
        }
    }

    // ── Death observers ──────────────────────────────────────────────────────

    /// Register `observer` for worker-death events of `caller`.
    pub async fn add_death_observer(
        &self,
        caller: &CallingIdentity,
        observer: DeathObserver,
    ) -> ObserverId {
        let started = Instant::now();
        let id = ObserverId::next();
        {
            let mut tables = self.inner.tables.lock().await;
            let entry = self.inner.entry_for(&mut tables, caller);
            entry.observers.insert(id, observer);
        }
        debug!(uid = caller.uid(), observer = %id, "death observer added");
        self.inner
            .record(ApiMethod::AddDeathObserver, Stage::Total, started, true, caller.uid());
        id
    }

    /// Convenience over [`Self::add_death_observer`] returning the receiver.
    pub async fn subscribe_death(
        &self,
        caller: &CallingIdentity,
    ) -> (ObserverId, mpsc::UnboundedReceiver<SandboxDeathEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.add_death_observer(caller, tx).await, rx)
    }

    /// Remove a registered observer; returns whether it was registered.
    pub async fn remove_death_observer(&self, caller: &CallingIdentity, id: ObserverId) -> bool {
        self.inner
            .tables
            .lock()
            .await
            .callers
            .get_mut(caller)
            .is_some_and(|entry| entry.observers.remove(&id).is_some())
    }

    // ── Death protocols ──────────────────────────────────────────────────────

    /// Run caller-death cleanup for `caller`.
    pub async fn on_caller_death(&self, caller: &CallingIdentity) {
        self.inner.on_caller_death(caller).await;
    }

    /// Run worker-death cleanup for the current link of `caller`.
    pub async fn on_worker_death(&self, caller: &CallingIdentity) {
        let Some(broker) = self.inner.broker_of(caller).await else {
            return;
        };
        let generation = broker.generation().await;
        self.inner.on_worker_death(caller, generation).await;
    }

    /// Apply a dropped connection for the current link of `caller`.
    pub async fn on_worker_disconnected(&self, caller: &CallingIdentity) {
        let Some(broker) = self.inner.broker_of(caller).await else {
            return;
        };
        let generation = broker.generation().await;
        broker.on_disconnected(generation).await;
    }

    // ── Administration ───────────────────────────────────────────────────────

    /// Stop `caller`'s worker; returns whether one was running.
    pub async fn stop_sandbox(&self, caller: &CallingIdentity) -> bool {
        self.inner
            .stop_sandbox_service(caller, "stopped by administrator")
            .await
    }

    /// Engage or release the kill switch. Engaging it stops every worker.
    pub async fn set_sandbox_disabled(&self, disabled: bool) {
        let was = self.inner.sandbox_disabled.swap(disabled, Ordering::AcqRel);
        info!(disabled, "sandbox kill switch updated");
        if disabled && !was {
            let callers: Vec<CallingIdentity> =
                self.inner.tables.lock().await.callers.keys().cloned().collect();
            for caller in callers {
                self.inner
                    .stop_sandbox_service(&caller, "sandbox disabled")
                    .await;
            }
        }
    }

    /// Kill-switch state.
    #[must_use]
    pub fn is_sandbox_disabled(&self) -> bool {
        self.inner.is_sandbox_disabled()
    }
}

impl CoordinatorInner {
    fn is_sandbox_disabled(&self) -> bool {
        self.sandbox_disabled.load(Ordering::Acquire)
    }

    fn record(&self, method: ApiMethod, stage: Stage, started: Instant, success: bool, uid: u32) {
        self.deps.telemetry.record(ApiEvent {
            method,
            stage,
            latency: started.elapsed(),
            success,
            uid,
        });
    }

    /// Entry for `caller`, created with its broker and caller-death watch.
    fn entry_for<'t>(&self, tables: &'t mut Tables, caller: &CallingIdentity) -> &'t mut CallerEntry {
        tables.callers.entry(caller.clone()).or_insert_with(|| {
            let observer: Weak<dyn LinkObserver> = self.this.clone();
            CallerEntry {
                identity: caller.clone(),
                broker: Arc::new(SandboxConnectionBroker::new(
                    caller.clone(),
                    Arc::clone(&self.deps.supervisor),
                    self.restart_policy,
                    observer,
                )),
                sessions: HashMap::new(),
                observers: HashMap::new(),
                caller_watch: self.watch_caller(caller),
            }
        })
    }

    fn watch_caller(&self, caller: &CallingIdentity) -> Option<CancellationToken> {
        let exited = caller.process_token()?.exited.clone();
        let stop = CancellationToken::new();
        let watch_stop = stop.clone();
        let this = self.this.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = watch_stop.cancelled() => {}
                () = exited.cancelled() => {
                    if let Some(inner) = this.upgrade() {
                        inner.on_caller_death(&caller).await;
                    }
                }
            }
        });
        Some(stop)
    }

    async fn broker_of(&self, caller: &CallingIdentity) -> Option<Arc<SandboxConnectionBroker>> {
        self.tables
            .lock()
            .await
            .callers
            .get(caller)
            .map(|entry| Arc::clone(&entry.broker))
    }

    async fn drive_load(
        &self,
        caller: CallingIdentity,
        session: Arc<LoadSession>,
        broker: Arc<SandboxConnectionBroker>,
        started: Instant,
    ) {
        let uid = caller.uid();

        if let Err(err) = self.deps.storage.prepare(&caller).await {
            session.handle_load_failure(err).await;
            self.record(ApiMethod::LoadSdk, Stage::Total, started, false, uid);
            return;
        }

        let (connect_callback, connect_rx) = callback::channel::<BrokerConnection>();
        broker.ensure_connected(connect_callback).await;
        let connected = match connect_rx.await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => {
                self.record(ApiMethod::LoadSdk, Stage::Connect, started, false, uid);
                let error = match err {
                    AppError::ProcessUnavailable(_) => err,
                    other => AppError::ProcessUnavailable(format!("failed to bind sandbox: {other}")),
                };
                session.handle_load_failure(error).await;
                self.record(ApiMethod::LoadSdk, Stage::Total, started, false, uid);
                return;
            }
            Err(_) => {
                session
                    .handle_load_failure(AppError::Internal("connect request abandoned".into()))
                    .await;
                self.record(ApiMethod::LoadSdk, Stage::Total, started, false, uid);
                return;
            }
        };
        self.record(ApiMethod::LoadSdk, Stage::Connect, started, true, uid);
        session.bind_link(connected.generation);

        let dirs = match self.deps.storage.sdk_storage_dirs(&caller, session.sdk_name()).await {
            Ok(dirs) => dirs,
            Err(err) => {
                session.handle_load_failure(err).await;
                self.record(ApiMethod::LoadSdk, Stage::Total, started, false, uid);
                return;
            }
        };

        let remote_started = Instant::now();
        match session.load(Some(connected.connection), dirs).await {
            Ok(LoadOutcome::Loaded) => {
                self.record(ApiMethod::LoadSdk, Stage::Remote, remote_started, true, uid);
            }
            Ok(LoadOutcome::Failed) => {
                self.record(ApiMethod::LoadSdk, Stage::Remote, remote_started, false, uid);
            }
            Ok(LoadOutcome::SandboxInitFailed) => {
                self.record(ApiMethod::LoadSdk, Stage::Remote, remote_started, false, uid);
                self.stop_sandbox_service(&caller, "sdk instantiation failed")
                    .await;
            }
            Err(err) => warn!(%err, "load issued twice"),
        }

        let success = session.status() == LoadStatus::Loaded;
        self.record(ApiMethod::LoadSdk, Stage::Total, started, success, uid);
    }

    /// Unbind and stop the worker of `caller` if it is connecting or connected.
    async fn stop_sandbox_service(&self, caller: &CallingIdentity, reason: &str) -> bool {
        let Some(broker) = self.broker_of(caller).await else {
            return false;
        };
        if !broker.is_running().await {
            return false;
        }
        info!(uid = caller.uid(), package = caller.package_name(), reason, "stopping sandbox service");
        broker.unbind().await;
        broker.stop().await
    }

    async fn on_caller_death(&self, caller: &CallingIdentity) {
        let Some(entry) = self.tables.lock().await.callers.remove(caller) else {
            return;
        };
        if let Some(watch) = &entry.caller_watch {
            watch.cancel();
        }
        info!(
            uid = caller.uid(),
            package = caller.package_name(),
            sessions = entry.sessions.len(),
            observers = entry.observers.len(),
            "caller died; releasing its sandbox"
        );
        entry.broker.close().await;
    }

    async fn on_worker_death(&self, caller: &CallingIdentity, generation: u64) {
        let Some(broker) = self.broker_of(caller).await else {
            debug!(uid = caller.uid(), "worker death for unknown caller");
            return;
        };

        let (identity, sessions, observers) = {
            let mut tables = self.tables.lock().await;
            let Some(entry) = tables.callers.get_mut(caller) else {
                return;
            };
            entry.observers.retain(|_, observer| !observer.is_closed());
            (
                entry.identity.clone(),
                entry
                    .sessions
                    .values()
                    .filter(|session| session.link_generation() == Some(generation))
                    .cloned()
                    .collect::<Vec<_>>(),
                entry.observers.values().cloned().collect::<Vec<_>>(),
            )
        };

        if broker.generation().await != generation {
            // A newer link exists; only sessions tied to the dead one are affected.
            debug!(
                uid = caller.uid(),
                generation,
                sessions = sessions.len(),
                "death of superseded worker"
            );
            for session in &sessions {
                session.on_worker_death().await;
            }
            return;
        }

        let mut unloaded_sdks: Vec<String> = sessions
            .iter()
            .filter(|session| session.status() == LoadStatus::Loaded)
            .map(|session| session.sdk_name().to_owned())
            .collect();
        unloaded_sdks.sort();

        let caller_alive = identity
            .process_token()
            .is_some_and(|token| !token.has_exited());
        let kill_caller = self.kill_caller_on_sandbox_death
            && self.restart_policy == RestartPolicy::Never
            && caller_alive
            && observers.is_empty()
            && !unloaded_sdks.is_empty();

        warn!(
            uid = caller.uid(),
            package = caller.package_name(),
            generation,
            sessions = sessions.len(),
            loaded = unloaded_sdks.len(),
            "sandbox process died"
        );

        for session in &sessions {
            session.on_worker_death().await;
        }

        let event = SandboxDeathEvent {
            uid: identity.uid(),
            package_name: identity.package_name().to_owned(),
            unloaded_sdks,
            occurred_at: Utc::now(),
        };
        for observer in &observers {
            if observer.send(event.clone()).is_err() {
                debug!(uid = caller.uid(), "death observer went away");
            }
        }

        broker.on_worker_death(generation).await;

        if kill_caller {
            warn!(
                uid = caller.uid(),
                package = caller.package_name(),
                "killing caller that lost its loaded sdks"
            );
            self.deps.supervisor.kill_caller(&identity).await;
        }
    }
}

impl LinkObserver for CoordinatorInner {
    fn worker_died(&self, caller: CallingIdentity, generation: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.on_worker_death(&caller, generation).await })
    }

    fn worker_disconnected(&self, caller: CallingIdentity, generation: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(broker) = self.broker_of(&caller).await {
                broker.on_disconnected(generation).await;
            }
        })
    }
}
