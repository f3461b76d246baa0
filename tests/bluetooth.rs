mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use common::{settle, wait_until};
use neurosity_rs::error::SdkError;
use neurosity_rs::parse::encode_samples;
use neurosity_rs::stream::watch_stream;
use neurosity_rs::transport::mock::MockPlatform;
use neurosity_rs::transport::{BluetoothClient, BluetoothConfig, BluetoothTransport, Discovery, SubscribeOptions};
use neurosity_rs::types::{Action, ConnectionState, Sample};

fn open_config() -> BluetoothConfig {
    BluetoothConfig {
        require_authentication: false,
        auto_connect: false,
        auto_reconnect: false,
        ..Default::default()
    }
}

fn headset() -> MockPlatform {
    MockPlatform::new(Discovery::Scan).with_device("Crown-A1")
}

fn state(ble: &BluetoothClient<MockPlatform>) -> ConnectionState {
    *ble.connection().borrow()
}

// ── Connection state machine ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_walks_through_connecting_to_connected() {
    let mock = headset().with_mtu(Some(247));
    mock.set_connect_delay(Duration::from_millis(200));
    let ble = BluetoothClient::new(mock.clone(), open_config());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut states = watch_stream(ble.connection());
    let record = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Some(s) = states.next().await {
            record.lock().unwrap().push(s);
        }
    });
    settle().await;

    ble.connect(None).await.unwrap();
    settle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert_eq!(mock.connect_count(), 1);
    assert_eq!(mock.mtu_request_count(), 1);

    mock.set_read("status", br#"{"state":"online"}"#.to_vec());
    let bytes = ble.read_characteristic("status").await.unwrap();
    assert_eq!(bytes, br#"{"state":"online"}"#);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_returns_to_disconnected() {
    let mock = headset();
    mock.fail_connects(1);
    let ble = BluetoothClient::new(mock.clone(), open_config());

    assert!(matches!(ble.connect(None).await, Err(SdkError::Platform(_))));
    assert_eq!(state(&ble), ConnectionState::Disconnected);

    ble.connect(None).await.unwrap();
    assert_eq!(state(&ble), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn headset_without_known_characteristics_is_rejected() {
    let names: Vec<&str> = neurosity_rs::protocol::CHARACTERISTICS.iter().map(|(n, _)| *n).collect();
    let mock = headset().without_characteristics(&names);
    let ble = BluetoothClient::new(mock.clone(), open_config());

    assert!(ble.connect(None).await.is_err());
    assert_eq!(state(&ble), ConnectionState::Disconnected);
    assert!(!mock.is_connected());
}

#[tokio::test(start_paused = true)]
async fn link_loss_invalidates_characteristic_handles() {
    let mock = headset();
    mock.set_read("status", b"{}".to_vec());
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();
    assert!(ble.read_characteristic("status").await.is_ok());

    mock.drop_link();
    wait_until("link loss", || state(&ble) == ConnectionState::Disconnected).await;

    assert_eq!(
        ble.read_characteristic("status").await,
        Err(SdkError::CharacteristicNotFound("status".into()))
    );
    assert_eq!(mock.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_characteristic_is_an_error_not_an_empty_stream() {
    let mock = headset().without_characteristics(&["accelerometer"]);
    let ble = BluetoothClient::new(mock, open_config());
    ble.connect(None).await.unwrap();

    let err = ble
        .subscribe_to_characteristic(SubscribeOptions::managed("accelerometer"))
        .await
        .err()
        .unwrap();
    assert_eq!(err, SdkError::CharacteristicNotFound("accelerometer".into()));
}

#[tokio::test(start_paused = true)]
async fn refused_notifications_name_the_characteristic() {
    let mock = headset();
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();
    mock.refuse_notifications(true);

    let err = ble
        .subscribe_to_characteristic(SubscribeOptions::managed("status"))
        .await
        .err()
        .unwrap();
    assert_eq!(
        err,
        SdkError::Notify {
            characteristic: "status".into(),
            message: "CCCD write rejected".into(),
        }
    );
}

// ── Reconnection ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn link_loss_triggers_exactly_one_reconnect_attempt() {
    let mock = headset();
    let config = BluetoothConfig {
        auto_reconnect: true,
        ..open_config()
    };
    let ble = BluetoothClient::new(mock.clone(), config);
    ble.connect(None).await.unwrap();

    mock.fail_connects(1);
    mock.drop_link();
    wait_until("reconnect attempt", || mock.connect_count() == 2).await;
    settle().await;
    assert_eq!(state(&ble), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(mock.connect_count(), 2, "no retry storm");

    // The next link loss gets its own attempt, which succeeds.
    ble.connect(None).await.unwrap();
    mock.drop_link();
    wait_until("reconnected", || state(&ble) == ConnectionState::Connected && mock.connect_count() == 4).await;
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_does_not_reconnect() {
    let mock = headset();
    let config = BluetoothConfig {
        auto_reconnect: true,
        ..open_config()
    };
    let ble = BluetoothClient::new(mock.clone(), config);
    ble.connect(None).await.unwrap();

    ble.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(state(&ble), ConnectionState::Disconnected);
    assert_eq!(mock.connect_count(), 1);
    assert_eq!(mock.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_reconnect_disabled_at_runtime() {
    let mock = headset();
    let config = BluetoothConfig {
        auto_reconnect: true,
        ..open_config()
    };
    let ble = BluetoothClient::new(mock.clone(), config);
    ble.set_auto_reconnect(false);

    ble.connect(None).await.unwrap();
    ble.disconnect().await.unwrap();
    ble.connect(None).await.unwrap();

    mock.drop_link();
    wait_until("link loss", || state(&ble) == ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(state(&ble), ConnectionState::Disconnected);
    assert_eq!(mock.connect_count(), 2);
}

// ── Browser-style discovery ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn request_discovery_uses_the_picker_and_skips_mtu() {
    let mock = MockPlatform::new(Discovery::Request).with_device("Notion-7");
    let ble = BluetoothClient::new(mock.clone(), open_config());

    assert!(ble.scan(None).is_none());
    ble.connect(None).await.unwrap();

    assert_eq!(state(&ble), ConnectionState::Connected);
    assert_eq!(mock.request_count(), 1);
    assert_eq!(mock.scan_count(), 0);
    assert_eq!(mock.mtu_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scan_accumulates_and_dedups_devices() {
    let mock = headset().with_device("Notion-2").with_device("SomethingElse");
    let ble = BluetoothClient::new(mock, open_config());

    let mut scan = ble.scan(None).unwrap();
    let devices = scan.next().await.unwrap().unwrap();
    let mut names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["Crown-A1", "Notion-2"]);
}

// ── Actions ───────────────────────────────────────────────────────────────────

/// Reply to every response-expecting action with `{"ok": true}`.
fn echo_responder(name: &str, data: &[u8]) -> Vec<(String, Vec<u8>)> {
    if name != "actions" {
        return Vec::new();
    }
    let Ok(action) = serde_json::from_slice::<Value>(data) else { return Vec::new() };
    if action["responseRequired"] != json!(true) {
        return Vec::new();
    }
    let reply = json!({ "actionId": action["actionId"], "response": { "ok": true } });
    vec![("actions".into(), format!("{reply}EOF").into_bytes())]
}

#[tokio::test(start_paused = true)]
async fn pending_actions_toggle_notifications_and_correlate() {
    let mock = headset();
    mock.set_responder(echo_responder);
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();
    settle().await;
    assert!(!mock.is_notifying("actions"));

    let action = Action::new("haptics", "queue").with_response(Duration::from_secs(4));
    let response = ble.dispatch_action(action).await.unwrap();
    assert_eq!(response, json!({ "ok": true }));

    settle().await;
    assert!(ble.pending_actions().borrow().is_empty());
    assert!(!mock.is_notifying("actions"));
    assert_eq!(mock.start_count("actions"), 1);
    assert_eq!(mock.stop_count("actions"), 1);
}

#[tokio::test(start_paused = true)]
async fn fire_and_forget_actions_leave_notifications_alone() {
    let mock = headset();
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();

    let result = ble.dispatch_action(Action::new("marker", "add")).await.unwrap();
    assert_eq!(result, Value::Null);
    settle().await;

    assert_eq!(mock.writes_to("actions").len(), 1);
    assert_eq!(mock.start_count("actions"), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_action_times_out_and_releases_pending() {
    let mock = headset();
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();

    let action = Action::new("wifi", "scan").with_response(Duration::from_secs(5));
    let err = ble.dispatch_action(action).await.unwrap_err();
    assert!(matches!(err, SdkError::Timeout { timeout_ms: 5000, .. }));

    settle().await;
    assert!(ble.pending_actions().borrow().is_empty());
    assert!(!mock.is_notifying("actions"));
}

// ── Shared metric streams ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn chunked_json_metric_is_shared_between_subscribers() {
    let mock = headset();
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();

    let mut a = ble.json_metric("focus");
    let mut b = ble.json_metric("focus");
    wait_until("focus notifications", || mock.is_notifying("focus")).await;
    assert_eq!(mock.start_count("focus"), 1);

    assert!(mock.notify_chunked("focus", r#"{"probability":0.42,"label":"focus"}EOF"#, 5));
    assert_eq!(a.next().await.unwrap().unwrap()["probability"], 0.42);
    assert_eq!(b.next().await.unwrap().unwrap()["probability"], 0.42);

    drop(a);
    settle().await;
    assert!(mock.is_notifying("focus"));

    drop(b);
    wait_until("focus stopped", || !mock.is_notifying("focus")).await;
    assert_eq!(mock.stop_count("focus"), 1);
}

#[tokio::test(start_paused = true)]
async fn metrics_wait_for_authentication() {
    let mock = headset();
    mock.set_read("auth", b"false".to_vec());
    let config = BluetoothConfig {
        require_authentication: true,
        ..open_config()
    };
    let ble = BluetoothClient::new(mock.clone(), config);
    ble.connect(None).await.unwrap();

    let mut status = ble.json_metric("status");
    settle().await;
    assert!(!*ble.ready().borrow());
    assert_eq!(mock.start_count("status"), 0);
    assert!(!ble.is_authenticated().await.unwrap());

    mock.set_read("auth", b"true".to_vec());
    assert!(ble.authenticate("custom-token").await.unwrap());
    assert_eq!(mock.writes_to("auth"), vec![b"custom-token".to_vec()]);

    wait_until("status notifications", || mock.is_notifying("status")).await;
    assert!(mock.notify("status", br#"{"state":"online"}EOF"#.to_vec()));
    assert_eq!(status.next().await.unwrap().unwrap()["state"], "online");
}

#[tokio::test(start_paused = true)]
async fn raw_notifications_become_epochs() {
    let mock = headset();
    let config = BluetoothConfig {
        default_channel_count: 2,
        ..open_config()
    };
    let ble = BluetoothClient::new(mock.clone(), config);
    ble.connect(None).await.unwrap();

    let mut epochs = ble.epochs("raw");
    wait_until("raw notifications", || mock.is_notifying("raw")).await;

    let samples: Vec<Sample> = (0..32u64)
        .map(|i| Sample {
            timestamp: 1_000 + i * 4,
            data: vec![i as f64, -(i as f64)],
            marker: None,
            info: None,
        })
        .collect();
    for frame in samples.chunks(8) {
        assert!(mock.notify("raw", encode_samples(frame, 2)));
    }

    let first = epochs.next().await.unwrap().unwrap();
    let second = epochs.next().await.unwrap().unwrap();
    for (epoch, start) in [(&first, 1_000), (&second, 1_064)] {
        assert_eq!(epoch.data.len(), 2);
        assert_eq!(epoch.data[0].len(), 16);
        assert_eq!(epoch.info.start_time, start);
        assert_eq!(epoch.info.sampling_rate, 256.0);
    }
    assert_eq!(second.data[1][0], -16.0);
}

#[tokio::test(start_paused = true)]
async fn frames_split_across_notifications_are_reassembled() {
    let mock = headset();
    let config = BluetoothConfig {
        default_channel_count: 2,
        ..open_config()
    };
    let ble = BluetoothClient::new(mock.clone(), config);
    ble.connect(None).await.unwrap();

    let mut epochs = ble.epochs("raw");
    wait_until("raw notifications", || mock.is_notifying("raw")).await;

    let samples: Vec<Sample> = (0..16u64)
        .map(|i| Sample {
            timestamp: 2_000 + i * 4,
            data: vec![i as f64, 0.5],
            marker: None,
            info: None,
        })
        .collect();
    let bytes = encode_samples(&samples, 2);
    assert_eq!(bytes.len(), 416);
    for part in bytes.chunks(20) {
        assert!(mock.notify("raw", part.to_vec()));
    }

    let epoch = epochs.next().await.unwrap().unwrap();
    assert_eq!(epoch.data[0].len(), 16);
    assert_eq!(epoch.data[0][15], 15.0);
    assert_eq!(epoch.data[1], vec![0.5; 16]);
    assert_eq!(epoch.info.start_time, 2_000);
}

#[tokio::test(start_paused = true)]
async fn character_split_across_notifications_decodes_intact() {
    let mock = headset();
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();

    let mut status = ble.json_metric("status");
    wait_until("status notifications", || mock.is_notifying("status")).await;

    let mut head = br#"{"ssid":"Caf"#.to_vec();
    head.push(0xC3);
    let mut tail = vec![0xA9];
    tail.extend_from_slice(br#""}EOF"#);
    assert!(mock.notify("status", head));
    assert!(mock.notify("status", tail));

    assert_eq!(status.next().await.unwrap().unwrap()["ssid"], "Café");
}

#[tokio::test(start_paused = true)]
async fn invalid_utf8_packet_errors_the_stream() {
    let mock = headset();
    let ble = BluetoothClient::new(mock.clone(), open_config());
    ble.connect(None).await.unwrap();

    let mut status = ble.json_metric("status");
    wait_until("status notifications", || mock.is_notifying("status")).await;
    assert!(mock.notify("status", vec![b'"', 0xFF, b'"', b'E', b'O', b'F']));

    assert!(matches!(status.next().await, Some(Err(SdkError::Encoding(_)))));
    assert!(status.next().await.is_none());
}
