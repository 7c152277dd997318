//! The full gateway over a real HTTP backend with a single throttle slot.

use std::time::Duration;

use encore_core::{BackendConfig, FieldMap, FindOptions, RecordId, ThrottleConfig};
use encore_gateway::{GatewayConfig, GatewayState, JanitorConfig};
use httpmock::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PREFIX: &str = "/fmi/data/vLatest/databases/Encore";

fn rows(id: &str) -> serde_json::Value {
    json!({
        "response": { "data": [{ "recordId": id, "modId": "1", "fieldData": {} }] },
        "messages": [{ "code": "0", "message": "OK" }]
    })
}

async fn single_slot_gateway(server: &MockServer) -> GatewayState {
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{}/sessions", PREFIX));
            then.status(200).json_body(json!({
                "response": { "token": "tok-1" },
                "messages": [{ "code": "0", "message": "OK" }]
            }));
        })
        .await;

    let config = GatewayConfig::new(BackendConfig::new(server.base_url(), "Encore", "api", "secret"))
        .with_janitor(JanitorConfig::disabled())
        .with_throttle(
            ThrottleConfig::default()
                .with_ceiling(1)
                .with_min_start_gap(Duration::ZERO),
        );
    GatewayState::start(config).expect("gateway starts")
}

#[tokio::test]
async fn test_cancelled_shared_read_does_not_stall_throttle() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{}/layouts/Slow/_find", PREFIX));
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(rows("1"));
        })
        .await;
    let read = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{}/layouts/Tracks/records/7", PREFIX));
            then.status(200).json_body(rows("7"));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("{}/layouts/Tracks/_find", PREFIX));
            then.status(200).json_body(rows("9"));
        })
        .await;

    let state = single_slot_gateway(&server).await;
    let gateway = state.gateway().clone();
    gateway
        .ensure_token(&CancellationToken::new())
        .await
        .expect("session opened");

    // Holds the only permit for half a second.
    let slow = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .find("Slow", &[FieldMap::new()], &FindOptions::new(), &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Queues behind it, then its only waiter gives up.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let abandoned = gateway
        .get_by_id("Tracks", &RecordId::new("7"), &cancel)
        .await;
    assert!(abandoned.expect_err("cancelled").is_cancelled());

    // Unrelated work still gets through once the slow call finishes.
    let found = tokio::time::timeout(
        Duration::from_secs(5),
        gateway.find("Tracks", &[FieldMap::new()], &FindOptions::new(), &CancellationToken::new()),
    )
    .await
    .expect("throttle not stalled")
    .expect("find succeeds");
    assert_eq!(found.len(), 1);

    slow.await.expect("join").expect("slow find succeeds");
    // The abandoned read still ran to completion and filled the cache.
    read.assert_hits_async(1).await;
    let cached = gateway
        .get_by_id("Tracks", &RecordId::new("7"), &CancellationToken::new())
        .await
        .expect("cached read");
    assert!(cached.is_some());
    read.assert_hits_async(1).await;
}
