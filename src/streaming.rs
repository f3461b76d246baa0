//! Streaming-mode selection.
//!
//! The caller declares a preference ([`StreamingMode`]); the selector keeps
//! the mode actually in effect ([`ActiveMode`]) up to date from three live
//! inputs: the selected device's BLE capability, the BLE connection state,
//! and the device's cloud connectivity.
//!
//! | requested | BLE usable & connected | active | connected |
//! |---|---|---|---|
//! | `WifiOnly` | any | Wi-Fi | cloud online |
//! | `WifiWithBluetoothFallback` | no | Wi-Fi | cloud online |
//! | `WifiWithBluetoothFallback` | yes | Wi-Fi if cloud online, else Bluetooth | `true` |
//! | `BluetoothWithWifiFallback` | yes | Bluetooth | `true` |
//! | `BluetoothWithWifiFallback` | no | Wi-Fi | cloud online |
//!
//! Without a selected device the state is Wi-Fi, not connected.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{SdkError, SdkResult};
use crate::stream::MetricStream;
use crate::types::{ConnectionState, DeviceInfo};

// ── Modes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamingMode {
    #[default]
    WifiOnly,
    WifiWithBluetoothFallback,
    BluetoothWithWifiFallback,
}

impl StreamingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamingMode::WifiOnly => "wifi-only",
            StreamingMode::WifiWithBluetoothFallback => "wifi-with-bluetooth-fallback",
            StreamingMode::BluetoothWithWifiFallback => "bluetooth-with-wifi-fallback",
        }
    }

    pub fn uses_bluetooth(self) -> bool {
        self != StreamingMode::WifiOnly
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamingMode {
    type Err = SdkError;

    /// Accepts kebab, snake and screaming-snake spellings.
    fn from_str(s: &str) -> SdkResult<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "wifi-only" => Ok(StreamingMode::WifiOnly),
            "wifi-with-bluetooth-fallback" => Ok(StreamingMode::WifiWithBluetoothFallback),
            "bluetooth-with-wifi-fallback" => Ok(StreamingMode::BluetoothWithWifiFallback),
            other => Err(SdkError::InvalidArgument(format!("unknown streaming mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveMode {
    #[default]
    Wifi,
    Bluetooth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingState {
    pub connected: bool,
    pub active_mode: ActiveMode,
    pub streaming_mode: StreamingMode,
}

// ── Decision ──────────────────────────────────────────────────────────────────

/// Live inputs of the decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectorInputs {
    pub device_selected: bool,
    /// The selected device's model and OS support BLE streaming.
    pub bluetooth_supported: bool,
    pub bluetooth_connected: bool,
    pub cloud_online: bool,
}

/// The decision table in the module docs.
pub fn select_mode(mode: StreamingMode, inputs: SelectorInputs) -> StreamingState {
    let wifi = |connected| StreamingState {
        connected,
        active_mode: ActiveMode::Wifi,
        streaming_mode: mode,
    };
    if !inputs.device_selected {
        return wifi(false);
    }

    let bluetooth = inputs.bluetooth_supported && inputs.bluetooth_connected;
    match mode {
        StreamingMode::WifiOnly => wifi(inputs.cloud_online),
        StreamingMode::WifiWithBluetoothFallback if bluetooth => StreamingState {
            connected: true,
            active_mode: if inputs.cloud_online {
                ActiveMode::Wifi
            } else {
                ActiveMode::Bluetooth
            },
            streaming_mode: mode,
        },
        StreamingMode::BluetoothWithWifiFallback if bluetooth => StreamingState {
            connected: true,
            active_mode: ActiveMode::Bluetooth,
            streaming_mode: mode,
        },
        _ => wifi(inputs.cloud_online),
    }
}

/// The mode actually used when `requested` asks for Bluetooth but no BLE
/// transport exists.  Returns the notice to report on downgrade.
pub fn effective_mode(requested: StreamingMode, has_bluetooth: bool) -> (StreamingMode, Option<String>) {
    if requested.uses_bluetooth() && !has_bluetooth {
        let notice = format!(
            "streaming mode {requested} needs a Bluetooth transport but none was configured, using {}",
            StreamingMode::WifiOnly
        );
        (StreamingMode::WifiOnly, Some(notice))
    } else {
        (requested, None)
    }
}

// ── Selector ──────────────────────────────────────────────────────────────────

/// Where metric subscriptions go right now.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub device: DeviceInfo,
    pub mode: ActiveMode,
}

type OnlineSource = dyn Fn(&str) -> MetricStream<bool> + Send + Sync;

/// Keeps [`StreamingState`] and the metric [`Route`] current.  Both are
/// distinct, replayed `watch` channels.
pub struct StreamingSelector {
    requested: StreamingMode,
    effective: StreamingMode,
    notice: Option<String>,
    state: watch::Receiver<StreamingState>,
    route: watch::Receiver<Option<Route>>,
    task: JoinHandle<()>,
}

impl StreamingSelector {
    /// `online_for(device_id)` must stream the device's cloud connectivity.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<F>(
        requested: StreamingMode,
        device: watch::Receiver<Option<DeviceInfo>>,
        bluetooth: Option<watch::Receiver<ConnectionState>>,
        online_for: F,
    ) -> Self
    where
        F: Fn(&str) -> MetricStream<bool> + Send + Sync + 'static,
    {
        let (effective, notice) = effective_mode(requested, bluetooth.is_some());
        if let Some(notice) = &notice {
            warn!("{notice}");
        }

        let initial = Snapshot::read(&device, bluetooth.as_ref(), false);
        let (state_tx, state) = watch::channel(select_mode(effective, initial.inputs));
        let (route_tx, route) = watch::channel(initial.route(effective));

        let task = tokio::spawn(run(
            effective,
            device,
            bluetooth,
            Arc::new(online_for),
            state_tx,
            route_tx,
        ));

        Self {
            requested,
            effective,
            notice,
            state,
            route,
            task,
        }
    }

    pub fn requested_mode(&self) -> StreamingMode {
        self.requested
    }

    pub fn effective_mode(&self) -> StreamingMode {
        self.effective
    }

    /// Set when the requested mode was downgraded at construction.
    pub fn downgrade_notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    pub fn state(&self) -> watch::Receiver<StreamingState> {
        self.state.clone()
    }

    pub fn current(&self) -> StreamingState {
        *self.state.borrow()
    }

    pub fn route(&self) -> watch::Receiver<Option<Route>> {
        self.route.clone()
    }

    pub fn current_route(&self) -> Option<Route> {
        self.route.borrow().clone()
    }
}

impl Drop for StreamingSelector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Snapshot {
    device: Option<DeviceInfo>,
    inputs: SelectorInputs,
}

impl Snapshot {
    fn read(
        device: &watch::Receiver<Option<DeviceInfo>>,
        bluetooth: Option<&watch::Receiver<ConnectionState>>,
        cloud_online: bool,
    ) -> Self {
        let device = device.borrow().clone();
        let inputs = SelectorInputs {
            device_selected: device.is_some(),
            bluetooth_supported: device.as_ref().is_some_and(|d| d.supports_bluetooth()),
            bluetooth_connected: bluetooth.is_some_and(|rx| *rx.borrow() == ConnectionState::Connected),
            cloud_online,
        };
        Self { device, inputs }
    }

    fn route(&self, mode: StreamingMode) -> Option<Route> {
        let state = select_mode(mode, self.inputs);
        self.device.clone().map(|device| Route {
            device,
            mode: state.active_mode,
        })
    }
}

fn publish<T: PartialEq>(tx: &watch::Sender<T>, value: T) -> bool {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    })
}

async fn next_online(online: &mut Option<MetricStream<bool>>) -> Option<SdkResult<bool>> {
    match online {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn bluetooth_changed(rx: &mut Option<watch::Receiver<ConnectionState>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn run(
    mode: StreamingMode,
    mut device: watch::Receiver<Option<DeviceInfo>>,
    mut bluetooth: Option<watch::Receiver<ConnectionState>>,
    online_for: Arc<OnlineSource>,
    state_tx: watch::Sender<StreamingState>,
    route_tx: watch::Sender<Option<Route>>,
) {
    let follow = |device: &Option<DeviceInfo>| device.as_ref().map(|d| online_for(&d.device_id));
    let mut online = follow(&device.borrow_and_update());
    let mut cloud_online = false;

    loop {
        let snapshot = Snapshot::read(&device, bluetooth.as_ref(), cloud_online);
        let state = select_mode(mode, snapshot.inputs);
        if publish(&state_tx, state) {
            debug!("streaming: {state:?}");
        }
        publish(&route_tx, snapshot.route(mode));

        tokio::select! {
            changed = device.changed() => {
                if changed.is_err() {
                    break;
                }
                // Tear down the old device's feed before following the new one.
                drop(online.take());
                cloud_online = false;
                online = follow(&device.borrow_and_update());
            }
            open = bluetooth_changed(&mut bluetooth) => {
                if !open {
                    bluetooth = None;
                }
            }
            item = next_online(&mut online) => match item {
                Some(Ok(value)) => cloud_online = value,
                Some(Err(e)) => {
                    warn!("streaming: cloud status feed failed: {e}");
                    online = None;
                    cloud_online = false;
                }
                None => {
                    online = None;
                    cloud_online = false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(supported: bool, connected: bool, online: bool) -> SelectorInputs {
        SelectorInputs {
            device_selected: true,
            bluetooth_supported: supported,
            bluetooth_connected: connected,
            cloud_online: online,
        }
    }

    fn pick(mode: StreamingMode, i: SelectorInputs) -> (ActiveMode, bool) {
        let s = select_mode(mode, i);
        assert_eq!(s.streaming_mode, mode);
        (s.active_mode, s.connected)
    }

    #[test]
    fn wifi_only_ignores_bluetooth() {
        use ActiveMode::*;
        let m = StreamingMode::WifiOnly;
        assert_eq!(pick(m, inputs(true, true, false)), (Wifi, false));
        assert_eq!(pick(m, inputs(true, true, true)), (Wifi, true));
    }

    #[test]
    fn wifi_with_bluetooth_fallback() {
        use ActiveMode::*;
        let m = StreamingMode::WifiWithBluetoothFallback;
        assert_eq!(pick(m, inputs(true, false, true)), (Wifi, true));
        assert_eq!(pick(m, inputs(false, true, false)), (Wifi, false));
        assert_eq!(pick(m, inputs(true, true, true)), (Wifi, true));
        assert_eq!(pick(m, inputs(true, true, false)), (Bluetooth, true));
    }

    #[test]
    fn bluetooth_with_wifi_fallback() {
        use ActiveMode::*;
        let m = StreamingMode::BluetoothWithWifiFallback;
        assert_eq!(pick(m, inputs(true, true, false)), (Bluetooth, true));
        assert_eq!(pick(m, inputs(true, false, true)), (Wifi, true));
        assert_eq!(pick(m, inputs(true, false, false)), (Wifi, false));
    }

    #[test]
    fn no_device_is_wifi_and_offline() {
        for mode in [
            StreamingMode::WifiOnly,
            StreamingMode::WifiWithBluetoothFallback,
            StreamingMode::BluetoothWithWifiFallback,
        ] {
            let s = select_mode(mode, SelectorInputs {
                bluetooth_supported: true,
                bluetooth_connected: true,
                cloud_online: true,
                ..Default::default()
            });
            assert_eq!((s.active_mode, s.connected), (ActiveMode::Wifi, false));
        }
    }

    #[test]
    fn bluetooth_modes_downgrade_without_transport() {
        let (mode, notice) = effective_mode(StreamingMode::BluetoothWithWifiFallback, false);
        assert_eq!(mode, StreamingMode::WifiOnly);
        assert!(notice.unwrap().contains("bluetooth-with-wifi-fallback"));
        assert_eq!(
            effective_mode(StreamingMode::WifiWithBluetoothFallback, true),
            (StreamingMode::WifiWithBluetoothFallback, None)
        );
    }

    #[test]
    fn parses_common_spellings() {
        assert_eq!(
            "BLUETOOTH_WITH_WIFI_FALLBACK".parse::<StreamingMode>().unwrap(),
            StreamingMode::BluetoothWithWifiFallback
        );
        assert_eq!("wifi-only".parse::<StreamingMode>().unwrap(), StreamingMode::WifiOnly);
        assert!("carrier-pigeon".parse::<StreamingMode>().is_err());
    }
}
