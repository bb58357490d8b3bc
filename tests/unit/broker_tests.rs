//! Connection broker generations, liveness notices, and restart policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sdk_sandbox_broker::callback;
use sdk_sandbox_broker::models::identity::CallingIdentity;
use sdk_sandbox_broker::models::sdk::{ClientDataUpdate, LoadRequest};
use sdk_sandbox_broker::sandbox::broker::{
    BrokerConnection, BrokerStatus, LinkObserver, RestartPolicy, SandboxConnectionBroker,
};
use sdk_sandbox_broker::sandbox::{
    BoxFuture, LoadedSdk, ProcessSupervisor, RemoteError, SandboxConnection,
    SandboxLink, WorkerLiveness,
};
use sdk_sandbox_broker::Result;
use tokio::sync::mpsc;

struct NullConnection;

impl SandboxConnection for NullConnection {
    fn load_sdk(
        &self,
        _request: LoadRequest,
    ) -> BoxFuture<'_, std::result::Result<LoadedSdk, RemoteError>> {
        Box::pin(async { Err(RemoteError::Dead) })
    }

    fn unload_sdk(&self, _sdk_name: &str) -> BoxFuture<'_, std::result::Result<(), RemoteError>> {
        Box::pin(async { Ok(()) })
    }

    fn sync_data(
        &self,
        _update: ClientDataUpdate,
    ) -> BoxFuture<'_, std::result::Result<(), RemoteError>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
struct CountingSupervisor {
    starts: AtomicUsize,
    stops: AtomicUsize,
    unbinds: AtomicUsize,
    links: Mutex<Vec<WorkerLiveness>>,
}

impl CountingSupervisor {
    fn liveness(&self, index: usize) -> WorkerLiveness {
        self.links.lock().unwrap()[index].clone()
    }
}

impl ProcessSupervisor for CountingSupervisor {
    fn start_and_connect(&self, _caller: &CallingIdentity) -> BoxFuture<'_, Result<SandboxLink>> {
        Box::pin(async move {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let liveness = WorkerLiveness::default();
            self.links.lock().unwrap().push(liveness.clone());
            Ok(SandboxLink {
                connection: Arc::new(NullConnection),
                liveness,
            })
        })
    }

    fn stop(&self, _caller: &CallingIdentity) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stops.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn unbind(&self, _caller: &CallingIdentity) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn kill_caller(&self, _caller: &CallingIdentity) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Notice {
    Died(u64),
    Disconnected(u64),
}

struct RecordingObserver {
    tx: mpsc::UnboundedSender<Notice>,
}

impl LinkObserver for RecordingObserver {
    fn worker_died(&self, _caller: CallingIdentity, generation: u64) -> BoxFuture<'_, ()> {
        let _ = self.tx.send(Notice::Died(generation));
        Box::pin(async {})
    }

    fn worker_disconnected(&self, _caller: CallingIdentity, generation: u64) -> BoxFuture<'_, ()> {
        let _ = self.tx.send(Notice::Disconnected(generation));
        Box::pin(async {})
    }
}

struct Fixture {
    broker: Arc<SandboxConnectionBroker>,
    supervisor: Arc<CountingSupervisor>,
    notices: mpsc::UnboundedReceiver<Notice>,
    _observer: Arc<RecordingObserver>,
}

fn fixture(policy: RestartPolicy) -> Fixture {
    let (tx, notices) = mpsc::unbounded_channel();
    let observer = Arc::new(RecordingObserver { tx });
    let weak: Weak<dyn LinkObserver> = Arc::downgrade(&observer) as Weak<dyn LinkObserver>;
    let supervisor = Arc::new(CountingSupervisor::default());
    let broker = Arc::new(SandboxConnectionBroker::new(
        CallingIdentity::new_unchecked(10_123, "com.example.app"),
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        policy,
        weak,
    ));
    Fixture {
        broker,
        supervisor,
        notices,
        _observer: observer,
    }
}

async fn connect(broker: &Arc<SandboxConnectionBroker>) -> BrokerConnection {
    let (cb, rx) = callback::channel();
    broker.ensure_connected(cb).await;
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("in time")
        .expect("resolved")
        .expect("connected")
}

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Notice {
    tokio::time::timeout(Duration::from_secs(2), notices.recv())
        .await
        .expect("notice in time")
        .expect("observer alive")
}

#[tokio::test]
async fn fresh_broker_is_idle() {
    let f = fixture(RestartPolicy::Never);
    assert_eq!(f.broker.status().await, BrokerStatus::NonExistent);
    assert!(!f.broker.is_running().await);
    assert!(!f.broker.is_bound().await);
    assert_eq!(f.broker.generation().await, 0);
    assert_eq!(f.broker.restart_policy(), RestartPolicy::Never);
    assert_eq!(f.broker.caller().package_name(), "com.example.app");
}

#[tokio::test]
async fn connect_binds_and_reports_connected() {
    let f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;

    assert_eq!(f.broker.status().await, BrokerStatus::Connected);
    assert!(f.broker.has_connection().await);
    assert!(f.broker.is_bound().await);
    assert_eq!(f.broker.generation().await, 1);
    assert_eq!(f.supervisor.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_connect_result_is_discarded() {
    let f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;

    let stale = SandboxLink {
        connection: Arc::new(NullConnection),
        liveness: WorkerLiveness::default(),
    };
    f.broker.on_connected(0, stale).await;
    f.broker
        .on_connect_failed(0, sdk_sandbox_broker::AppError::Internal("late".into()))
        .await;

    assert_eq!(f.broker.status().await, BrokerStatus::Connected);
    assert!(f.broker.has_connection().await);
    assert_eq!(f.supervisor.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exit_is_reported_with_its_generation() {
    let mut f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;

    f.supervisor.liveness(0).exited.cancel();

    assert_eq!(next_notice(&mut f.notices).await, Notice::Died(1));
}

#[tokio::test]
async fn disconnect_is_reported_then_exit() {
    let mut f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;
    let liveness = f.supervisor.liveness(0);

    liveness.disconnected.cancel();
    assert_eq!(next_notice(&mut f.notices).await, Notice::Disconnected(1));
    assert!(f.broker.on_disconnected(1).await);
    assert!(!f.broker.has_connection().await);
    assert_eq!(f.broker.status().await, BrokerStatus::Connected);

    liveness.exited.cancel();
    assert_eq!(next_notice(&mut f.notices).await, Notice::Died(1));
}

#[tokio::test]
async fn disconnected_link_reconnects_on_demand() {
    let f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;
    assert!(f.broker.on_disconnected(1).await);

    connect(&f.broker).await;

    assert_eq!(f.supervisor.starts.load(Ordering::SeqCst), 2);
    assert_eq!(f.broker.generation().await, 2);
}

#[tokio::test]
async fn stale_liveness_notices_are_ignored() {
    let f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;

    assert!(!f.broker.on_disconnected(7).await);
    assert!(!f.broker.on_worker_death(7).await);
    assert!(f.broker.has_connection().await);
}

#[tokio::test]
async fn death_without_restart_resets_broker() {
    let f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;

    assert!(f.broker.on_worker_death(1).await);

    assert_eq!(f.broker.status().await, BrokerStatus::NonExistent);
    assert_eq!(f.supervisor.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn death_of_bound_worker_restarts_under_policy() {
    let f = fixture(RestartPolicy::RestartWhileBound);
    connect(&f.broker).await;

    assert!(f.broker.on_worker_death(1).await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !f.broker.has_connection().await || f.broker.generation().await != 2 {
        assert!(tokio::time::Instant::now() < deadline, "restart timed out");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(f.supervisor.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unbound_worker_is_not_restarted() {
    let f = fixture(RestartPolicy::RestartWhileBound);
    connect(&f.broker).await;

    f.broker.unbind().await;
    f.broker.unbind().await;
    assert_eq!(f.supervisor.unbinds.load(Ordering::SeqCst), 1);

    assert!(f.broker.on_worker_death(1).await);
    assert_eq!(f.broker.status().await, BrokerStatus::NonExistent);
    assert_eq!(f.supervisor.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_keeps_watching_the_exit() {
    let mut f = fixture(RestartPolicy::Never);
    connect(&f.broker).await;

    assert!(f.broker.stop().await);
    assert!(!f.broker.stop().await);
    assert_eq!(f.supervisor.stops.load(Ordering::SeqCst), 1);
    assert_eq!(f.broker.status().await, BrokerStatus::NonExistent);

    f.supervisor.liveness(0).exited.cancel();
    assert_eq!(next_notice(&mut f.notices).await, Notice::Died(1));
}

#[tokio::test]
async fn closed_broker_refuses_connects() {
    let f = fixture(RestartPolicy::RestartWhileBound);
    connect(&f.broker).await;

    assert!(f.broker.close().await);
    assert!(f.broker.is_closed().await);
    assert_eq!(f.supervisor.unbinds.load(Ordering::SeqCst), 1);
    assert_eq!(f.supervisor.stops.load(Ordering::SeqCst), 1);

    let (cb, rx) = callback::channel();
    f.broker.ensure_connected(cb).await;
    let err = rx.await.expect("resolved").expect_err("closed");
    assert_eq!(err.code(), sdk_sandbox_broker::ErrorCode::ProcessUnavailable);
    assert_eq!(f.supervisor.starts.load(Ordering::SeqCst), 1);
    assert!(!f.broker.is_bound().await);
}
