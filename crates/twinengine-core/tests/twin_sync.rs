//! End-to-end twin synchronization tests
//!
//! These tests drive a full engine over the mock transport: desired-property
//! notifications are injected as if they came from the service and the
//! resulting acknowledgement patches are observed on the transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use twinengine_core::transport::mock::MockTransport;
use twinengine_core::{
    AckOverrides, ConnectionState, EngineConfig, ReconnectPolicy, StaticIdentity, TwinEngine,
    TwinError,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn engine_over(transport: Arc<MockTransport>) -> TwinEngine {
    TwinEngine::builder(transport, Arc::new(StaticIdentity::new("CERT", "KEY"))).build()
}

/// Poll until `condition` holds or a generous deadline passes
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within deadline");
}

// ============================================================================
// Acknowledgement Scenarios
// ============================================================================

/// A writable-property change yields exactly one reported ack patch with the
/// exact envelope shape
#[tokio::test]
async fn test_writable_change_acknowledged_with_exact_envelope() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("compA", vec!["temp".to_string()])
        .unwrap();
    engine.connect().await.unwrap();

    // Wire-form delta: the version travels inside the tree
    transport
        .inject_desired_delta(json!({"$version": 5, "compA": {"temp": 21}}))
        .unwrap();

    wait_until(|| !transport.reported_patches().is_empty()).await;
    let patches = transport.reported_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0],
        json!({
            "compA": {
                "__t": "c",
                "temp": {
                    "value": 21,
                    "ackCode": 200,
                    "ackDescription": "Successfully updated (temp) to (21)",
                    "ackVersion": 5,
                },
            }
        })
    );
}

/// A throwing property handler produces a 400 ack with no override merge
#[tokio::test]
async fn test_failing_handler_acknowledged_with_400() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("compA", vec!["temp".to_string()])
        .unwrap();
    engine
        .on_property_update(
            "compA",
            "temp",
            Arc::new(|_, _| Err(TwinError::Handler("actuator stuck".to_string()))),
        )
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(5, json!({"compA": {"temp": 21}}));

    wait_until(|| !transport.reported_patches().is_empty()).await;
    let ack = &transport.reported_patches()[0]["compA"]["temp"];
    assert_eq!(ack["ackCode"], json!(400));
    assert_eq!(ack["ackDescription"], json!("Updating (temp) state to (21) failed"));
    assert_eq!(ack["ackVersion"], json!(5));
}

/// Properties not declared writable are never auto-acknowledged
#[tokio::test]
async fn test_non_writable_property_not_acknowledged() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("compA", vec!["temp".to_string()])
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(6, json!({"compA": {"humidity": 40}}));
    // A second, writable change acts as the fence: once its ack lands we
    // know the earlier notification was fully processed.
    transport.inject_desired_change(7, json!({"compA": {"temp": 19}}));

    wait_until(|| !transport.reported_patches().is_empty()).await;
    let patches = transport.reported_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0]["compA"]["temp"]["ackVersion"], json!(7));
}

/// Each property in one notification gets its own report call; ordering
/// across properties is unspecified
#[tokio::test]
async fn test_multiple_properties_acknowledged_independently() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("compA", vec!["temp".to_string(), "mode".to_string()])
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(3, json!({"compA": {"temp": 21, "mode": "eco"}}));

    wait_until(|| transport.reported_patches().len() == 2).await;
    let mut acknowledged: Vec<String> = transport
        .reported_patches()
        .iter()
        .flat_map(|patch| {
            patch["compA"]
                .as_object()
                .unwrap()
                .keys()
                .filter(|k| *k != "__t")
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect();
    acknowledged.sort();
    assert_eq!(acknowledged, vec!["mode".to_string(), "temp".to_string()]);
}

/// Partial handler failure yields partial acknowledgement: the failing
/// property gets a 400, the healthy one a 200
#[tokio::test]
async fn test_partial_failure_yields_partial_acknowledgement() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("compA", vec!["temp".to_string(), "mode".to_string()])
        .unwrap();
    engine
        .on_property_update(
            "compA",
            "mode",
            Arc::new(|_, _| Err(TwinError::Handler("unsupported mode".to_string()))),
        )
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(4, json!({"compA": {"temp": 18, "mode": "turbo"}}));

    wait_until(|| transport.reported_patches().len() == 2).await;
    let codes: Vec<i64> = transport
        .reported_patches()
        .iter()
        .map(|patch| {
            let component = patch["compA"].as_object().unwrap();
            let property = component.keys().find(|k| *k != "__t").unwrap();
            component[property]["ackCode"].as_i64().unwrap()
        })
        .collect();
    assert!(codes.contains(&200));
    assert!(codes.contains(&400));
}

/// Handler-supplied overrides customize the success envelope only
#[tokio::test]
async fn test_handler_overrides_applied_end_to_end() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("compA", vec!["temp".to_string()])
        .unwrap();
    engine
        .on_property_update(
            "compA",
            "temp",
            Arc::new(|_, _| {
                Ok(Some(AckOverrides {
                    ack_code: Some(202),
                    ack_description: Some("Ramping to target".to_string()),
                    value: None,
                }))
            }),
        )
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(8, json!({"compA": {"temp": 25}}));

    wait_until(|| !transport.reported_patches().is_empty()).await;
    let ack = &transport.reported_patches()[0]["compA"]["temp"];
    assert_eq!(ack["ackCode"], json!(202));
    assert_eq!(ack["ackDescription"], json!("Ramping to target"));
    assert_eq!(ack["ackVersion"], json!(8));
}

/// A property handler may call back into the engine while dispatch is
/// running; handlers run outside the registry lock, so the callback cannot
/// stall the event loop
#[tokio::test]
async fn test_handler_can_query_handle_during_dispatch() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    let handle = engine
        .register_component("compA", vec!["temp".to_string()])
        .unwrap();

    let reentrant = handle.clone();
    engine
        .on_property_update(
            "compA",
            "temp",
            Arc::new(move |_, _| {
                // Locks the registry from inside dispatch
                assert_eq!(reentrant.writable_properties(), vec!["temp".to_string()]);
                Ok(None)
            }),
        )
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(5, json!({"compA": {"temp": 21}}));

    wait_until(|| !transport.reported_patches().is_empty()).await;
    assert_eq!(
        transport.reported_patches()[0]["compA"]["temp"]["ackCode"],
        json!(200)
    );
}

/// Deltas touching several components are routed independently
#[tokio::test]
async fn test_multi_component_delta_routed_per_component() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine
        .register_component("thermostat", vec!["target".to_string()])
        .unwrap();
    engine
        .register_component("fan", vec!["speed".to_string()])
        .unwrap();
    engine.connect().await.unwrap();

    transport.inject_desired_change(
        2,
        json!({
            "$version": 2,
            "thermostat": {"target": 20},
            "fan": {"speed": 3},
            "unregistered": {"x": 1},
        }),
    );

    wait_until(|| transport.reported_patches().len() == 2).await;
    let mut components: Vec<String> = transport
        .reported_patches()
        .iter()
        .map(|patch| patch.as_object().unwrap().keys().next().unwrap().clone())
        .collect();
    components.sort();
    assert_eq!(components, vec!["fan".to_string(), "thermostat".to_string()]);
}

// ============================================================================
// Lifecycle Scenarios
// ============================================================================

/// A disconnect event while connected triggers an automatic reconnect with
/// no caller action
#[tokio::test]
async fn test_automatic_reconnect_on_disconnect() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine.connect().await.unwrap();
    assert_eq!(transport.open_attempts(), 1);

    transport.inject(twinengine_core::TransportEvent::Disconnected {
        reason: Some("network reset".to_string()),
    });

    wait_until(|| transport.open_attempts() >= 2).await;
    wait_until(|| engine.state() == ConnectionState::Connected).await;
}

/// Reconnect attempts keep issuing fresh opens until one succeeds
#[tokio::test]
async fn test_reconnect_retries_until_success() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine.connect().await.unwrap();

    transport.fail_next_opens(2);
    transport.inject(twinengine_core::TransportEvent::Disconnected { reason: None });

    // 1 initial + 2 failed reconnects + 1 successful reconnect
    wait_until(|| transport.open_attempts() >= 4).await;
    wait_until(|| engine.state() == ConnectionState::Connected).await;
}

/// A second disconnect while a reconnect loop is pending supersedes it
/// instead of stacking a concurrent loop
#[tokio::test]
async fn test_repeated_disconnects_do_not_stack_reconnect_loops() {
    let transport = Arc::new(MockTransport::new());
    let engine = TwinEngine::builder(
        transport.clone(),
        Arc::new(StaticIdentity::new("CERT", "KEY")),
    )
    .config(EngineConfig::new().with_reconnect(ReconnectPolicy::Delayed {
        delay: Duration::from_millis(100),
        max_attempts: Some(1),
    }))
    .build();
    engine.connect().await.unwrap();
    transport.fail_next_opens(u32::MAX);

    transport.inject(twinengine_core::TransportEvent::Disconnected { reason: None });
    transport.inject(twinengine_core::TransportEvent::Disconnected { reason: None });

    // Only the superseding loop's single bounded attempt lands: one initial
    // open plus one failed reconnect
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.open_attempts(), 2);
}

/// With the Never policy, a disconnect leaves the engine disconnected
#[tokio::test]
async fn test_never_policy_suppresses_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let engine = TwinEngine::builder(
        transport.clone(),
        Arc::new(StaticIdentity::new("CERT", "KEY")),
    )
    .config(EngineConfig::new().with_reconnect(ReconnectPolicy::Never))
    .build();
    engine.connect().await.unwrap();

    transport.inject(twinengine_core::TransportEvent::Disconnected { reason: None });

    wait_until(|| engine.state() == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

/// Deliberate disconnect does not trigger reconnection
#[tokio::test]
async fn test_explicit_disconnect_does_not_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine.connect().await.unwrap();

    engine.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.open_attempts(), 1);
    assert!(!transport.is_open());
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

/// Late signal subscribers immediately observe the most recent emission
#[tokio::test]
async fn test_late_subscriber_sees_latest_signal() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine.connect().await.unwrap();

    // Let the event loop process the transport's connected event
    wait_until(|| {
        let mut rx = engine.subscribe_connected();
        rx.try_recv().is_some()
    })
    .await;

    transport.inject(twinengine_core::TransportEvent::Error("glitch".to_string()));
    wait_until(|| {
        let mut rx = engine.subscribe_errors();
        rx.try_recv() == Some("glitch".to_string())
    })
    .await;

    // A brand new subscriber still sees the stored emission
    let mut late = engine.subscribe_errors();
    assert_eq!(late.try_recv(), Some("glitch".to_string()));
}

/// Cloud-to-device messages surface on the message signal
#[tokio::test]
async fn test_message_events_surface_on_signal() {
    let transport = Arc::new(MockTransport::new());
    let engine = engine_over(transport.clone());
    engine.connect().await.unwrap();
    let mut messages = engine.subscribe_messages();

    transport.inject(twinengine_core::TransportEvent::Message(json!({"cmd": "ping"})));

    let payload: Value = messages.recv().await.unwrap();
    assert_eq!(payload, json!({"cmd": "ping"}));
}
