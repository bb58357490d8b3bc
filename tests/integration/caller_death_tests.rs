//! Caller-death protocol.

use std::sync::atomic::Ordering;

use sdk_sandbox_broker::callback;
use sdk_sandbox_broker::models::sdk::Bundle;
use sdk_sandbox_broker::ErrorCode;

use super::test_helpers::{
    caller_with_token, eventually, harness, harness_with_gated_storage, recv,
};

#[tokio::test]
async fn caller_death_removes_bookkeeping_and_stops_worker() {
    let h = harness();
    let (id, token) = caller_with_token();
    let (_observer, _events) = h.coordinator.subscribe_death(&id).await;
    h.coordinator
        .load_sdk(id.clone(), "sdk.alpha", Bundle::new())
        .await
        .expect("load");

    token.exited.cancel();

    let coordinator = &h.coordinator;
    eventually("caller forgotten", move || async move {
        coordinator.snapshot().await.callers.is_empty()
    })
    .await;
    assert_eq!(h.supervisor.unbinds(), 1);
    assert_eq!(h.supervisor.stops(), 1);
    assert!(h.coordinator.list_loaded_sdks(&id).await.is_empty());
    assert_eq!(h.coordinator.broker_status(&id).await, None);
    assert_eq!(h.supervisor.kills(), 0);
}

#[tokio::test]
async fn observer_registration_alone_watches_caller() {
    let h = harness();
    let (id, token) = caller_with_token();
    let (_observer, _events) = h.coordinator.subscribe_death(&id).await;
    assert_eq!(h.coordinator.snapshot().await.callers[0].observer_count, 1);

    token.exited.cancel();

    let coordinator = &h.coordinator;
    eventually("caller forgotten", move || async move {
        coordinator.snapshot().await.callers.is_empty()
    })
    .await;
    // No worker was ever started, so there is nothing to stop.
    assert_eq!(h.supervisor.stops(), 0);
}

#[tokio::test]
async fn caller_death_during_connect_abandons_pending_load() {
    let h = harness();
    let (id, token) = caller_with_token();
    let start_gate = h.supervisor.hold_starts();

    let (cb, rx) = callback::channel();
    h.coordinator
        .load(id.clone(), "sdk.alpha", Bundle::new(), cb)
        .await;
    let supervisor = &h.supervisor;
    eventually("start issued", move || async move { supervisor.starts() == 1 }).await;

    token.exited.cancel();
    let coordinator = &h.coordinator;
    eventually("caller forgotten", move || async move {
        coordinator.snapshot().await.callers.is_empty()
    })
    .await;

    // The stopped attempt fails its waiters; the late start is discarded.
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), rx)
        .await
        .expect("load resolved");
    assert!(matches!(outcome, Ok(Err(_)) | Err(_)));

    h.supervisor.release_starts();
    start_gate.notify_waiters();
    tokio::task::yield_now().await;
    assert!(h.coordinator.snapshot().await.callers.is_empty());
}

#[tokio::test]
async fn second_caller_death_notice_is_harmless() {
    let h = harness();
    let (id, _token) = caller_with_token();
    h.coordinator
        .load_sdk(id.clone(), "sdk.alpha", Bundle::new())
        .await
        .expect("load");

    h.coordinator.on_caller_death(&id).await;
    h.coordinator.on_caller_death(&id).await;

    assert_eq!(h.supervisor.stops(), 1);
    assert!(h.coordinator.snapshot().await.callers.is_empty());
}

#[tokio::test]
async fn caller_death_before_connect_never_starts_worker() {
    let (h, storage, gate) = harness_with_gated_storage();
    let (id, token) = caller_with_token();

    let (cb, rx) = callback::channel();
    h.coordinator
        .load(id.clone(), "sdk.alpha", Bundle::new(), cb)
        .await;
    let watched = &storage;
    eventually("storage prepare entered", move || async move {
        watched.prepares() == 1
    })
    .await;

    token.exited.cancel();
    let coordinator = &h.coordinator;
    eventually("caller forgotten", move || async move {
        coordinator.snapshot().await.callers.is_empty()
    })
    .await;

    gate.notify_waiters();
    let err = recv(rx).await.expect_err("closed sandbox refuses the load");
    assert_eq!(err.code(), ErrorCode::ProcessUnavailable);
    assert_eq!(h.supervisor.starts(), 0);
    assert_eq!(h.connection().load_calls.load(Ordering::SeqCst), 0);
    assert!(h.coordinator.snapshot().await.callers.is_empty());
}
