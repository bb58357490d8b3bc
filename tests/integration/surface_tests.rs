//! Surface-package requests routed through the coordinator.

use std::sync::atomic::Ordering;

use sdk_sandbox_broker::callback;
use sdk_sandbox_broker::models::sdk::{Bundle, SurfaceParams};
use sdk_sandbox_broker::telemetry::{ApiEvent, ApiMethod};
use sdk_sandbox_broker::ErrorCode;

use super::test_helpers::{caller, eventually, harness, recv, RecordingTelemetry};

fn surface_params() -> SurfaceParams {
    let mut params = Bundle::new();
    params.insert("slot".into(), serde_json::json!("banner"));
    SurfaceParams {
        host_token: "host-1".into(),
        display_id: 0,
        width: 320,
        height: 50,
        params,
    }
}

#[tokio::test]
async fn surface_without_load_is_rejected_without_starting_worker() {
    let h = harness();
    let id = caller();

    let err = h
        .coordinator
        .request_surface_package_async(&id, "sdk.alpha", surface_params())
        .await
        .expect_err("nothing loaded");

    assert_eq!(err.code(), ErrorCode::SurfacePackageNotLoaded);
    assert_eq!(h.supervisor.starts(), 0);
}

#[tokio::test]
async fn surface_from_loaded_sdk_is_delivered() {
    let h = harness();
    let id = caller();
    h.coordinator
        .load_sdk(id.clone(), "sdk.alpha", Bundle::new())
        .await
        .expect("load");

    let package = h
        .coordinator
        .request_surface_package_async(&id, "sdk.alpha", surface_params())
        .await
        .expect("surface");

    assert_eq!(package.surface_package_id, 42);
    assert_eq!(package.params.get("slot"), Some(&serde_json::json!("banner")));
}

#[tokio::test]
async fn surface_while_load_pending_is_rejected() {
    let h = harness();
    let id = caller();
    let gate = h.connection().hold_loads();
    let (cb, load_rx) = callback::channel();
    h.coordinator
        .load(id.clone(), "sdk.alpha", Bundle::new(), cb)
        .await;

    let err = h
        .coordinator
        .request_surface_package_async(&id, "sdk.alpha", surface_params())
        .await
        .expect_err("still loading");
    assert_eq!(err.code(), ErrorCode::SurfacePackageNotLoaded);

    let conn = &h.supervisor.connection;
    eventually("load call issued", move || async move {
        conn.load_calls.load(Ordering::SeqCst) == 1
    })
    .await;
    gate.notify_waiters();
    recv(load_rx).await.expect("load completes");
}

#[tokio::test]
async fn unload_fails_pending_surface_requests() {
    let h = harness();
    let id = caller();
    h.coordinator
        .load_sdk(id.clone(), "sdk.alpha", Bundle::new())
        .await
        .expect("load");
    let gate = h.connection().hold_surfaces();

    let (cb, rx) = callback::channel();
    h.coordinator
        .request_surface_package(&id, "sdk.alpha", surface_params(), cb)
        .await;
    let conn = &h.supervisor.connection;
    eventually("surface call issued", move || async move {
        conn.surface_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    h.coordinator.unload(&id, "sdk.alpha").await.expect("unload");
    let err = recv(rx).await.expect_err("unload drains surfaces");
    assert_eq!(err.code(), ErrorCode::SurfacePackageNotLoaded);

    gate.notify_waiters();
    tokio::task::yield_now().await;
}

#[tokio::test]
async fn surface_after_unload_is_rejected() {
    let h = harness();
    let id = caller();
    h.coordinator
        .load_sdk(id.clone(), "sdk.alpha", Bundle::new())
        .await
        .expect("load");
    h.coordinator.unload(&id, "sdk.alpha").await.expect("unload");

    let err = h
        .coordinator
        .request_surface_package_async(&id, "sdk.alpha", surface_params())
        .await
        .expect_err("unloaded");
    assert_eq!(err.code(), ErrorCode::SurfacePackageNotLoaded);
    assert_eq!(h.connection().surface_calls.load(Ordering::SeqCst), 0);
}

fn surface_outcomes(telemetry: &RecordingTelemetry) -> Vec<bool> {
    telemetry
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|event: &&ApiEvent| event.method == ApiMethod::RequestSurfacePackage)
        .map(|event| event.success)
        .collect()
}

#[tokio::test]
async fn surface_telemetry_reports_delivery() {
    let h = harness();
    let id = caller();
    let gate = h.connection().hold_loads();
    let (cb, load_rx) = callback::channel();
    h.coordinator
        .load(id.clone(), "sdk.alpha", Bundle::new(), cb)
        .await;
    let conn = &h.supervisor.connection;
    eventually("load call issued", move || async move {
        conn.load_calls.load(Ordering::SeqCst) == 1
    })
    .await;

    h.coordinator
        .request_surface_package_async(&id, "sdk.alpha", surface_params())
        .await
        .expect_err("load still pending");
    let telemetry = &h.telemetry;
    eventually("rejection recorded", move || async move {
        surface_outcomes(telemetry) == vec![false]
    })
    .await;

    gate.notify_waiters();
    recv(load_rx).await.expect("load completes");
    h.coordinator
        .request_surface_package_async(&id, "sdk.alpha", surface_params())
        .await
        .expect("surface");
    eventually("delivery recorded", move || async move {
        surface_outcomes(telemetry) == vec![false, true]
    })
    .await;
}
