//! Per-caller worker connection broker.
//!
//! At most one start-and-connect call is outstanding per caller. Concurrent
//! [`SandboxConnectionBroker::ensure_connected`] requests made while a
//! connect is in flight queue behind it and all observe its outcome.
//!
//! Every connect attempt gets a fresh *generation*. Results and liveness
//! notices tagged with an older generation are ignored, so a late answer
//! from a superseded attempt or a death notice from a replaced worker
//! cannot disturb the current link.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::callback::Callback;
use crate::models::identity::CallingIdentity;
use crate::sandbox::{BoxFuture, ConnectionHandle, ProcessSupervisor, SandboxLink, WorkerLiveness};
use crate::{AppError, Result};

/// Connection handed to connect waiters.
#[derive(Clone)]
pub struct BrokerConnection {
    /// Generation of the link the connection belongs to.
    pub generation: u64,
    /// Service handle.
    pub connection: ConnectionHandle,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Callback resolved with the outcome of a connect attempt.
pub type ConnectCallback = Callback<BrokerConnection>;

/// What happens to a bound worker after it dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// A dead worker stays dead until the next connect request.
    #[default]
    Never,
    /// A worker still bound by its caller is restarted and reconnected.
    RestartWhileBound,
}

/// Externally visible broker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerStatus {
    /// No worker.
    NonExistent,
    /// A connect attempt is in flight.
    Connecting,
    /// A worker was connected.
    Connected,
}

/// Receives liveness notices from a broker's link watcher.
pub trait LinkObserver: Send + Sync {
    /// The worker of link `generation` exited.
    fn worker_died(&self, caller: CallingIdentity, generation: u64) -> BoxFuture<'_, ()>;

    /// The connection of link `generation` dropped.
    fn worker_disconnected(&self, caller: CallingIdentity, generation: u64) -> BoxFuture<'_, ()>;
}

/// Observer that ignores every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLinkObserver;

impl LinkObserver for NoopLinkObserver {
    fn worker_died(&self, _caller: CallingIdentity, _generation: u64) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn worker_disconnected(&self, _caller: CallingIdentity, _generation: u64) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

enum Link {
    NonExistent,
    Connecting,
    /// `connection` is cleared when the link drops while the worker may live on.
    Connected { connection: Option<ConnectionHandle> },
}

struct BrokerState {
    link: Link,
    bound_by_caller: bool,
    pending: Vec<ConnectCallback>,
    generation: u64,
    closed: bool,
}

/// Owns the worker connection lifecycle of one caller.
pub struct SandboxConnectionBroker {
    caller: CallingIdentity,
    supervisor: Arc<dyn ProcessSupervisor>,
    policy: RestartPolicy,
    observer: Weak<dyn LinkObserver>,
    state: Mutex<BrokerState>,
}

impl SandboxConnectionBroker {
    /// Broker for `caller`. Liveness notices go to `observer` while it lives.
    #[must_use]
    pub fn new(
        caller: CallingIdentity,
        supervisor: Arc<dyn ProcessSupervisor>,
        policy: RestartPolicy,
        observer: Weak<dyn LinkObserver>,
    ) -> Self {
        Self {
            caller,
            supervisor,
            policy,
            observer,
            state: Mutex::new(BrokerState {
                link: Link::NonExistent,
                bound_by_caller: false,
                pending: Vec::new(),
                generation: 0,
                closed: false,
            }),
        }
    }

    /// Caller this broker serves.
    #[must_use]
    pub fn caller(&self) -> &CallingIdentity {
        &self.caller
    }

    /// Restart policy in effect.
    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Resolve `callback` with a live connection, starting one if needed.
    ///
    /// A connected broker answers immediately. A connecting broker queues the
    /// callback behind the in-flight attempt. Otherwise a new attempt is
    /// started and the callback is its first waiter. A closed broker rejects
    /// the callback with `AppError::ProcessUnavailable`.
    pub async fn ensure_connected(self: &Arc<Self>, callback: ConnectCallback) {
        let mut state = self.state.lock().await;
        if state.closed {
            drop(state);
            debug!(uid = self.caller.uid(), "connect on closed broker refused");
            callback.resolve(Err(AppError::ProcessUnavailable(
                "caller is gone; sandbox closed".into(),
            )));
            return;
        }
        state.bound_by_caller = true;

        match &state.link {
            Link::Connected {
                connection: Some(connection),
            } => {
                let connection = BrokerConnection {
                    generation: state.generation,
                    connection: Arc::clone(connection),
                };
                drop(state);
                callback.resolve(Ok(connection));
            }
            Link::Connecting => {
                debug!(
                    uid = self.caller.uid(),
                    package = self.caller.package_name(),
                    waiters = state.pending.len() + 1,
                    "joining in-flight sandbox connect"
                );
                state.pending.push(callback);
            }
            Link::NonExistent | Link::Connected { connection: None } => {
                state.pending.push(callback);
                let generation = Self::begin_attempt(&mut state);
                drop(state);
                self.spawn_connect(generation);
            }
        }
    }

    /// Apply a successful connect of attempt `generation`.
    pub async fn on_connected(self: &Arc<Self>, generation: u64, link: SandboxLink) {
        let mut state = self.state.lock().await;
        if state.generation != generation || !matches!(state.link, Link::Connecting) {
            let abandoned = matches!(state.link, Link::NonExistent);
            drop(state);
            debug!(
                uid = self.caller.uid(),
                generation, "discarding connection from superseded attempt"
            );
            if abandoned {
                self.supervisor.stop(&self.caller).await;
            }
            return;
        }

        state.link = Link::Connected {
            connection: Some(Arc::clone(&link.connection)),
        };
        let waiters = mem::take(&mut state.pending);
        drop(state);

        info!(
            uid = self.caller.uid(),
            package = self.caller.package_name(),
            generation,
            waiters = waiters.len(),
            "sandbox connected"
        );

        self.spawn_watcher(generation, link.liveness);
        for waiter in waiters {
            waiter.resolve(Ok(BrokerConnection {
                generation,
                connection: Arc::clone(&link.connection),
            }));
        }
    }

    /// Apply a failed connect of attempt `generation`.
    pub async fn on_connect_failed(&self, generation: u64, error: AppError) {
        let mut state = self.state.lock().await;
        if state.generation != generation || !matches!(state.link, Link::Connecting) {
            debug!(uid = self.caller.uid(), generation, "ignoring failure of superseded attempt");
            return;
        }

        state.link = Link::NonExistent;
        state.bound_by_caller = false;
        let waiters = mem::take(&mut state.pending);
        drop(state);

        warn!(
            uid = self.caller.uid(),
            package = self.caller.package_name(),
            %error,
            waiters = waiters.len(),
            "sandbox connect failed"
        );
        for waiter in waiters {
            waiter.resolve(Err(error.clone()));
        }
    }

    /// The connection of link `generation` dropped; the worker may still run.
    ///
    /// Returns whether the notice applied to the current link.
    pub async fn on_disconnected(&self, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return false;
        }
        match &mut state.link {
            Link::Connected { connection } => {
                *connection = None;
                info!(uid = self.caller.uid(), generation, "sandbox connection dropped");
                true
            }
            Link::NonExistent | Link::Connecting => false,
        }
    }

    /// The worker of link `generation` died.
    ///
    /// A death reported while connecting abandons the attempt and fails its
    /// waiters; a late connect result is then discarded and its worker
    /// stopped. Returns whether the notice applied to the current link.
    pub async fn on_worker_death(self: &Arc<Self>, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return false;
        }

        if matches!(state.link, Link::Connecting) {
            state.generation += 1;
            state.link = Link::NonExistent;
            let waiters = mem::take(&mut state.pending);
            drop(state);
            warn!(
                uid = self.caller.uid(),
                generation,
                waiters = waiters.len(),
                "sandbox died while connecting"
            );
            for waiter in waiters {
                waiter.resolve(Err(AppError::ProcessUnavailable(
                    "sandbox died while connecting".into(),
                )));
            }
            return true;
        }

        if self.policy == RestartPolicy::RestartWhileBound && state.bound_by_caller {
            let next = Self::begin_attempt(&mut state);
            drop(state);
            info!(uid = self.caller.uid(), generation = next, "restarting bound sandbox");
            self.spawn_connect(next);
        } else {
            state.link = Link::NonExistent;
            drop(state);
            info!(uid = self.caller.uid(), generation, "sandbox gone");
        }
        true
    }

    /// Release the caller's binding.
    ///
    /// An unbound worker is no longer restarted after death.
    pub async fn unbind(&self) {
        let was_bound = mem::replace(&mut self.state.lock().await.bound_by_caller, false);
        if was_bound {
            self.supervisor.unbind(&self.caller).await;
        }
    }

    /// Refuse every later connect, then unbind and stop.
    ///
    /// Used once the caller is gone; returns whether a worker was stopped.
    pub async fn close(&self) -> bool {
        self.state.lock().await.closed = true;
        self.unbind().await;
        self.stop().await
    }

    /// Whether [`close`](Self::close) has run.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Tear the worker down.
    ///
    /// Only acts while connecting or connected; returns whether it did. An
    /// in-flight attempt is abandoned and its waiters fail. The link watcher
    /// keeps running so the worker's exit is still reported.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let waiters = match state.link {
            Link::NonExistent => return false,
            Link::Connecting => {
                state.generation += 1;
                mem::take(&mut state.pending)
            }
            Link::Connected { .. } => Vec::new(),
        };
        state.link = Link::NonExistent;
        drop(state);

        info!(uid = self.caller.uid(), package = self.caller.package_name(), "stopping sandbox");
        for waiter in waiters {
            waiter.resolve(Err(AppError::ProcessUnavailable(
                "sandbox was stopped while connecting".into(),
            )));
        }
        self.supervisor.stop(&self.caller).await;
        true
    }

    /// Current status.
    pub async fn status(&self) -> BrokerStatus {
        match self.state.lock().await.link {
            Link::NonExistent => BrokerStatus::NonExistent,
            Link::Connecting => BrokerStatus::Connecting,
            Link::Connected { .. } => BrokerStatus::Connected,
        }
    }

    /// Whether a live connection handle is held.
    pub async fn has_connection(&self) -> bool {
        matches!(
            self.state.lock().await.link,
            Link::Connected {
                connection: Some(_)
            }
        )
    }

    /// Live connection handle, if connected.
    pub async fn connection(&self) -> Option<ConnectionHandle> {
        match &self.state.lock().await.link {
            Link::Connected {
                connection: Some(connection),
            } => Some(Arc::clone(connection)),
            Link::NonExistent | Link::Connecting | Link::Connected { connection: None } => None,
        }
    }

    /// Whether the worker is connecting or connected.
    pub async fn is_running(&self) -> bool {
        !matches!(self.state.lock().await.link, Link::NonExistent)
    }

    /// Whether the caller currently holds a binding.
    pub async fn is_bound(&self) -> bool {
        self.state.lock().await.bound_by_caller
    }

    /// Generation of the current or most recent link.
    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    fn begin_attempt(state: &mut BrokerState) -> u64 {
        state.link = Link::Connecting;
        state.generation += 1;
        state.generation
    }

    fn spawn_connect(self: &Arc<Self>, generation: u64) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            debug!(uid = broker.caller.uid(), generation, "starting sandbox");
            let result: Result<SandboxLink> = broker.supervisor.start_and_connect(&broker.caller).await;
            match result {
                Ok(link) => broker.on_connected(generation, link).await,
                Err(err) => broker.on_connect_failed(generation, err).await,
            }
        });
    }

    fn spawn_watcher(&self, generation: u64, liveness: WorkerLiveness) {
        let caller = self.caller.clone();
        let observer = self.observer.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = liveness.exited.cancelled() => {}
                () = liveness.disconnected.cancelled() => {
                    if let Some(observer) = observer.upgrade() {
                        observer.worker_disconnected(caller.clone(), generation).await;
                    }
                    liveness.exited.cancelled().await;
                }
            }

            if let Some(observer) = observer.upgrade() {
                observer.worker_died(caller, generation).await;
            }
        });
    }
}
