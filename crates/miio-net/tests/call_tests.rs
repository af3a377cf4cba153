//! Device Call Engine Tests (miio-net)
//!
//! Tests for the per-device call state machine against a fake device:
//! - Happy-path calls and enrichment
//! - Handshake timeout retry
//! - Device-requested resend (invalid stamp) with the +100 id bump
//! - Device error message remapping
//! - Retry exhaustion

use miio_net::{CallOptions, DeviceInfo, ManagerConfig, NetEvent, NetworkManager};
use miio_test_utils::{find_available_udp_port, FakeDevice, FakeDeviceConfig};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

fn local_manager() -> Arc<NetworkManager> {
    let target: SocketAddr = format!("127.0.0.1:{}", find_available_udp_port())
        .parse()
        .unwrap();
    NetworkManager::with_config(ManagerConfig {
        broadcast_target: target,
        ..Default::default()
    })
}

/// Register the fake as a device record and enrich it, so later calls
/// exercise only the path under test.
async fn enriched_device(
    manager: &Arc<NetworkManager>,
    fake: &FakeDevice,
    config: &FakeDeviceConfig,
) -> Arc<DeviceInfo> {
    let device = manager
        .find_device(config.device_id, Some(fake.addr()))
        .expect("record created");
    device.set_manual_token(config.token);
    device.enrich().await.expect("enrichment against the fake");
    device
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn call_returns_the_result_field() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    let result = device
        .call("get_status", json!([]), CallOptions::default())
        .await
        .expect("call should succeed");

    assert_eq!(result, json!(["ok"]));
    assert_eq!(device.model().as_deref(), Some("rockrobo.vacuum.v1"));
    assert!(fake.methods_seen().contains(&"get_status".to_string()));
}

#[tokio::test]
async fn canned_replies_are_returned_per_method() {
    let mut config = FakeDeviceConfig::default();
    config
        .replies
        .insert("get_prop".to_string(), json!([38, "on"]));
    let fake = FakeDevice::start(config.clone()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    let result = device
        .call("get_prop", json!(["temp", "power"]), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!([38, "on"]));
}

// ============================================================================
// Handshake Timeout Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn handshake_timeout_is_retried_without_recovery() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    let handshakes_before = fake.handshakes_seen();
    let mut events = manager.subscribe();

    // Force a handshake and swallow the first attempt, so the 5 s
    // deadline fires and the call engine schedules a plain retry.
    device.mark_handshake_required();
    fake.set_ignore_handshakes(1);

    let result = device
        .call("get_status", json!([]), CallOptions::default())
        .await;
    assert!(result.is_ok(), "call should survive a handshake timeout");
    assert!(
        fake.handshakes_seen() >= handshakes_before + 2,
        "the timed-out handshake must be followed by a fresh one"
    );

    // A handshake timeout retries without touching the socket.
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, NetEvent::SocketReset { .. }),
            "handshake timeout must not reset the socket"
        );
    }
}

// ============================================================================
// Device-Requested Resend (Invalid Stamp)
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalid_stamp_triggers_rehandshake_and_id_bump() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    let handshakes_before = fake.handshakes_seen();

    fake.push_error(-9999, "invalid stamp");
    let result = device
        .call("get_status", json!([]), CallOptions::default())
        .await;
    assert!(result.is_ok(), "resend after invalid stamp should succeed");

    let ids = fake.request_ids_for("get_status");
    assert!(ids.len() >= 2, "rejected attempt plus at least one resend");
    for pair in ids.windows(2) {
        assert_eq!(
            pair[1],
            pair[0] + 100,
            "retries must bump the request id by 100"
        );
    }
    assert!(
        fake.handshakes_seen() > handshakes_before,
        "invalid stamp must force a fresh handshake"
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_stmp_spelling_is_also_retried() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    fake.push_error(-30001, "device err: invalid_stmp");

    let result = device
        .call("get_status", json!([]), CallOptions::default())
        .await;
    assert!(result.is_ok());
    assert!(fake.request_ids_for("get_status").len() >= 2);
}

// ============================================================================
// Device Error Remapping
// ============================================================================

#[tokio::test]
async fn unsupported_method_message_is_rewritten() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    fake.push_error(-10000, "unknown");

    let err = device
        .call("frobnicate", json!([]), CallOptions::default())
        .await
        .expect_err("the device rejected the method");
    assert_eq!(err.to_string(), "Method `frobnicate` is not supported");
    assert_eq!(err.device_code(), Some(-10000));
}

#[tokio::test]
async fn invalid_arg_message_is_rewritten() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    fake.push_error(-5001, "invalid_arg");

    let err = device
        .call("set_power", json!(["maybe"]), CallOptions::default())
        .await
        .expect_err("invalid argument");
    assert_eq!(err.to_string(), "Invalid argument");
    assert_eq!(err.device_code(), Some(-5001));
}

#[tokio::test]
async fn other_device_errors_pass_through() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    fake.push_error(-42, "battery on fire");

    let err = device
        .call("get_status", json!([]), CallOptions::default())
        .await
        .expect_err("device error");
    assert_eq!(err.to_string(), "battery on fire");
    assert_eq!(err.device_code(), Some(-42));
}

// ============================================================================
// Retry Exhaustion
// ============================================================================

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_a_timeout() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    fake.set_ignore_requests(u32::MAX);

    let err = device
        .call(
            "get_status",
            json!([]),
            CallOptions {
                retries: 0,
                ..Default::default()
            },
        )
        .await
        .expect_err("no reply and no retries left");
    assert_eq!(err.code(), "timeout");
    assert_eq!(err.to_string(), "Call to device timed out");
}

#[tokio::test(start_paused = true)]
async fn retries_eventually_succeed_when_replies_resume() {
    let config = FakeDeviceConfig::default();
    let fake = FakeDevice::start(FakeDeviceConfig::default()).await;
    let manager = local_manager();
    let _reference = manager.acquire().unwrap();

    let device = enriched_device(&manager, &fake, &config).await;
    fake.set_ignore_requests(2);

    let result = device
        .call("get_status", json!([]), CallOptions::default())
        .await;
    assert!(result.is_ok(), "call should recover once replies resume");
    assert!(
        fake.request_ids_for("get_status").len() >= 3,
        "two dropped attempts plus the answered one"
    );
}
