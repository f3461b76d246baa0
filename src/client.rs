//! The SDK facade.
//!
//! [`NeurosityClient`] ties a [`CloudTransport`] and an optional
//! [`BluetoothTransport`] together behind one surface:
//!
//! | Category | Operations |
//! |---|---|
//! | session | `login`, `logout`, `create_account`, `delete_account` |
//! | devices | `get_devices`, `select_device`, `select_device_by_id`, `get_selected_device`, `on_device_change`, `add_device`, `remove_device`, `transfer_device`, `get_info` |
//! | metrics | `status`, `settings`, `signal_quality`, `accelerometer`, `brainwaves`, `calm`, `focus`, `kinesis`, `predictions` |
//! | commands | `add_marker`, `haptics`, `change_settings`, `training()` |
//! | OAuth (server only) | `create_oauth_url`, `get_oauth_token`, `remove_oauth_access` |
//!
//! Every metric and command is checked locally, in order, for the caller's
//! OAuth scopes, a selected device, and hardware capability.  A failed check
//! errors without touching either transport.
//!
//! Metric streams follow the [`StreamingSelector`]: whenever the active mode
//! or the selected device changes the previous subscription is dropped and
//! a new one opened on the right transport.  Commands ask the selector once.
//!
//! ## Example
//!
//! ```no_run
//! # async fn demo(cloud: std::sync::Arc<dyn neurosity_rs::cloud::CloudTransport>) -> neurosity_rs::error::SdkResult<()> {
//! use futures::StreamExt;
//! use neurosity_rs::client::{ClientConfig, NeurosityClient};
//! use neurosity_rs::cloud::Credentials;
//!
//! let client = NeurosityClient::new(ClientConfig::from_env(), cloud, None);
//! client
//!     .login(Credentials::EmailPassword {
//!         email: "me@example.com".into(),
//!         password: "hunter2".into(),
//!     })
//!     .await?;
//!
//! let mut calm = client.calm();
//! while let Some(score) = calm.next().await {
//!     println!("calm {:.2}", score?.probability);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cloud::{
    CloudClient, CloudTransport, Credentials, OAuthQuery, OAuthUrlConfig, User, UserClaims,
    SETTINGS_NAMESPACE,
};
use crate::error::{SdkError, SdkResult};
use crate::permissions;
use crate::protocol::{characteristic, HAPTICS_RESPONSE_TIMEOUT};
use crate::stream::{broadcast_stream, error_stream, switch_map, watch_stream, MetricStream};
use crate::streaming::{ActiveMode, Route, StreamingMode, StreamingSelector, StreamingState};
use crate::transport::BluetoothTransport;
use crate::types::{
    Accelerometer, Action, Brainwaves, ConnectionState, DeviceInfo, DeviceStatus, Epoch, Feature,
    Prediction, Probability, Settings, SignalQuality, TrainingOptions, BRAINWAVES_LABELS,
};

/// Haptic motors addressable by `haptics`.
pub const HAPTIC_MOTORS: [&str; 2] = ["P7", "P8"];
/// Most effects one motor accepts per command.
pub const MAX_HAPTIC_EFFECTS: usize = 7;

const DIAGNOSTICS_CAPACITY: usize = 64;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Where the SDK is running.  OAuth helpers need a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Runtime {
    #[default]
    Client,
    Server,
}

/// Configuration for [`NeurosityClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device selected on login.  Login fails if the account does not own it.
    pub device_id: Option<String>,
    pub streaming_mode: StreamingMode,
    /// Select the first claimed device on login when `device_id` is unset.
    pub auto_select_device: bool,
    pub runtime: Runtime,
    /// Backend name recorded on every metric subscription.
    pub metrics_server: String,
    /// Recorded on every metric subscription.  Random per client by default.
    pub client_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            streaming_mode: StreamingMode::WifiOnly,
            auto_select_device: true,
            runtime: Runtime::Client,
            metrics_server: "firebase".into(),
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `NEUROSITY_DEVICE_ID` and
    /// `NEUROSITY_STREAMING_MODE`.  An unknown mode falls back to Wi-Fi only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(id) = std::env::var("NEUROSITY_DEVICE_ID") {
            let id = id.trim();
            if !id.is_empty() {
                config.device_id = Some(id.to_owned());
            }
        }
        if let Ok(mode) = std::env::var("NEUROSITY_STREAMING_MODE") {
            match mode.parse() {
                Ok(mode) => config.streaming_mode = mode,
                Err(e) => warn!("{e}, using {}", StreamingMode::WifiOnly),
            }
        }
        config
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// Warning-level notices for the caller, replayed to late subscribers.
struct Diagnostics {
    history: Mutex<Vec<String>>,
    tx: broadcast::Sender<String>,
}

impl Diagnostics {
    fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            tx: broadcast::channel(DIAGNOSTICS_CAPACITY).0,
        }
    }

    fn push(&self, notice: impl Into<String>) {
        let notice = notice.into();
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push(notice.clone());
        let _ = self.tx.send(notice);
    }

    fn stream(&self) -> BoxStream<'static, String> {
        // Subscribe under the lock so nothing falls between replay and live.
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let live = broadcast_stream(self.tx.subscribe());
        stream::iter(history.clone()).chain(live).boxed()
    }
}

// ── NeurosityClient ───────────────────────────────────────────────────────────

/// Entry point of the SDK.  See the module docs.
pub struct NeurosityClient {
    config: ClientConfig,
    cloud: CloudClient,
    bluetooth: Option<Arc<dyn BluetoothTransport>>,
    selected: watch::Sender<Option<DeviceInfo>>,
    selector: StreamingSelector,
    diagnostics: Arc<Diagnostics>,
    tasks: Vec<JoinHandle<()>>,
}

impl NeurosityClient {
    /// Build a client.  `bluetooth` is optional; without it any Bluetooth
    /// streaming mode is downgraded to Wi-Fi only and reported on
    /// [`diagnostics`](Self::diagnostics).
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: ClientConfig,
        cloud: Arc<dyn CloudTransport>,
        bluetooth: Option<Arc<dyn BluetoothTransport>>,
    ) -> Self {
        let cloud = CloudClient::new(cloud, config.client_id.clone(), config.metrics_server.clone());
        let selected = watch::Sender::new(None);
        let diagnostics = Arc::new(Diagnostics::new());

        let online = cloud.clone();
        let selector = StreamingSelector::new(
            config.streaming_mode,
            selected.subscribe(),
            bluetooth.as_ref().map(|b| b.connection()),
            move |device_id| online.online(device_id),
        );
        if let Some(notice) = selector.downgrade_notice() {
            diagnostics.push(notice);
        }

        let mut tasks = Vec::new();
        if let Some(ble) = &bluetooth {
            ble.attach_device(selected.subscribe());
            tasks.push(tokio::spawn(authenticate_on_connect(
                cloud.clone(),
                Arc::clone(ble),
                selected.subscribe(),
            )));
        }
        info!(
            "client ready: streaming mode {} (requested {})",
            selector.effective_mode(),
            selector.requested_mode()
        );

        Self {
            config,
            cloud,
            bluetooth,
            selected,
            selector,
            diagnostics,
            tasks,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn cloud(&self) -> &CloudClient {
        &self.cloud
    }

    pub fn bluetooth(&self) -> Option<&Arc<dyn BluetoothTransport>> {
        self.bluetooth.as_ref()
    }

    /// Streaming mode in effect after any downgrade.
    pub fn streaming_mode(&self) -> StreamingMode {
        self.selector.effective_mode()
    }

    /// Current streaming state, then every change.
    pub fn streaming_state(&self) -> BoxStream<'static, StreamingState> {
        watch_stream(self.selector.state())
    }

    /// Warning-level notices such as a streaming mode downgrade.  Past
    /// notices are replayed first.
    pub fn diagnostics(&self) -> BoxStream<'static, String> {
        self.diagnostics.stream()
    }

    // ── Checks ────────────────────────────────────────────────────────────────

    fn claims(&self) -> Option<UserClaims> {
        let claims = self.cloud.transport().user_claims();
        let current = claims.borrow().clone();
        current
    }

    fn ensure_logged_in(&self, function: &str) -> SdkResult<()> {
        let user = self.cloud.transport().user();
        let logged_in = user.borrow().is_some();
        if logged_in {
            Ok(())
        } else {
            Err(SdkError::NotLoggedIn(function.to_owned()))
        }
    }

    fn ensure_server(&self, function: &str) -> SdkResult<()> {
        match self.config.runtime {
            Runtime::Server => Ok(()),
            Runtime::Client => Err(SdkError::ServerOnly(function.to_owned())),
        }
    }

    fn selected_for(&self, function: &str) -> SdkResult<DeviceInfo> {
        self.selected
            .borrow()
            .clone()
            .ok_or_else(|| SdkError::NoDeviceSelected(function.to_owned()))
    }

    /// Scope, selection and capability checks, in that order.
    fn check(&self, function: &str, feature: Option<Feature>) -> SdkResult<DeviceInfo> {
        permissions::check(function, self.claims().as_ref())?;
        let device = self.selected_for(function)?;
        if let Some(feature) = feature {
            if !device.supports(feature) {
                return Err(SdkError::Unsupported {
                    feature: feature.name().to_owned(),
                    model_version: device.model_version.clone(),
                });
            }
        }
        Ok(device)
    }

    // ── Session ───────────────────────────────────────────────────────────────

    /// Sign in and select the configured (or first) device.
    pub async fn login(&self, credentials: Credentials) -> SdkResult<User> {
        let user = self.cloud.transport().login(credentials).await?;
        info!("logged in as {}", user.uid);

        if let Some(id) = self.config.device_id.clone() {
            self.select_device_by_id(&id).await?;
        } else if self.config.auto_select_device {
            let devices = self.cloud.transport().get_devices().await?;
            match devices.into_iter().next() {
                Some(device) => self.set_selected(Some(device)).await,
                None => debug!("account has no claimed devices, nothing selected"),
            }
        }
        Ok(user)
    }

    /// Drop every subscription, the selection and the BLE link, then sign out.
    pub async fn logout(&self) -> SdkResult<()> {
        self.set_selected(None).await;
        if let Some(ble) = &self.bluetooth {
            if let Err(e) = ble.disconnect().await {
                warn!("logout: Bluetooth disconnect failed: {e}");
            }
        }
        self.cloud.transport().logout().await
    }

    pub async fn create_account(&self, email: &str, password: &str) -> SdkResult<User> {
        self.cloud.transport().create_account(email, password).await
    }

    pub async fn delete_account(&self) -> SdkResult<()> {
        self.ensure_logged_in("delete_account")?;
        self.set_selected(None).await;
        self.cloud.transport().delete_account().await
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    pub async fn get_devices(&self) -> SdkResult<Vec<DeviceInfo>> {
        self.ensure_logged_in("get_devices")?;
        self.cloud.transport().get_devices().await
    }

    /// Select the device `selector` picks from the claimed devices.
    pub async fn select_device<F>(&self, selector: F) -> SdkResult<DeviceInfo>
    where
        F: FnOnce(&[DeviceInfo]) -> Option<&DeviceInfo>,
    {
        let devices = self.get_devices().await?;
        let device = selector(&devices)
            .cloned()
            .ok_or_else(|| SdkError::DeviceNotFound("(no device matched the selector)".into()))?;
        self.set_selected(Some(device.clone())).await;
        Ok(device)
    }

    pub async fn select_device_by_id(&self, device_id: &str) -> SdkResult<DeviceInfo> {
        let devices = self.get_devices().await?;
        let device = devices
            .into_iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| SdkError::DeviceNotFound(device_id.to_owned()))?;
        self.set_selected(Some(device.clone())).await;
        Ok(device)
    }

    pub fn get_selected_device(&self) -> Option<DeviceInfo> {
        self.selected.borrow().clone()
    }

    /// Current selection, then every change.
    pub fn on_device_change(&self) -> BoxStream<'static, Option<DeviceInfo>> {
        watch_stream(self.selected.subscribe())
    }

    async fn set_selected(&self, device: Option<DeviceInfo>) {
        let previous = self.selected.borrow().as_ref().map(|d| d.device_id.clone());
        let next = device.as_ref().map(|d| d.device_id.clone());
        if previous != next {
            self.cloud.clear_subscriptions(previous.as_deref()).await;
            match &device {
                Some(d) => info!("selected device {} ({})", d.device_nickname, d.device_id),
                None => info!("device deselected"),
            }
        }
        self.selected.send_if_modified(|current| {
            if *current == device {
                false
            } else {
                *current = device;
                true
            }
        });
    }

    pub async fn add_device(&self, device_id: &str) -> SdkResult<()> {
        self.ensure_logged_in("add_device")?;
        self.cloud.transport().add_device(device_id).await
    }

    /// Unclaim a device.  Removing the selected device deselects it.
    pub async fn remove_device(&self, device_id: &str) -> SdkResult<()> {
        self.ensure_logged_in("remove_device")?;
        self.cloud.transport().remove_device(device_id).await?;
        let was_selected = self
            .selected
            .borrow()
            .as_ref()
            .is_some_and(|d| d.device_id == device_id);
        if was_selected {
            self.set_selected(None).await;
        }
        Ok(())
    }

    pub async fn transfer_device(&self, device_id: &str, recipient_email: &str) -> SdkResult<()> {
        self.ensure_logged_in("transfer_device")?;
        self.cloud.transport().transfer_device(device_id, recipient_email).await
    }

    /// Fresh hardware description of the selected device.
    pub async fn get_info(&self) -> SdkResult<DeviceInfo> {
        let device = self.check("get_info", None)?;
        self.cloud.transport().get_info(&device.device_id).await
    }

    // ── Metric routing ────────────────────────────────────────────────────────

    /// Checked stream that follows the active mode.
    fn routed<T, W, B>(&self, function: &str, feature: Option<Feature>, wifi: W, bluetooth: B) -> MetricStream<T>
    where
        T: Send + 'static,
        W: Fn(&CloudClient, &DeviceInfo) -> MetricStream<T> + Send + 'static,
        B: Fn(&dyn BluetoothTransport, &DeviceInfo) -> MetricStream<T> + Send + 'static,
    {
        if let Err(e) = self.check(function, feature) {
            return error_stream(e);
        }
        let cloud = self.cloud.clone();
        let ble = self.bluetooth.clone();
        switch_map(self.selector.route(), move |route: &Option<Route>| {
            let route = route.as_ref()?;
            let stream = match (route.mode, &ble) {
                (ActiveMode::Bluetooth, Some(ble)) => {
                    debug!("{}: streaming over Bluetooth", route.device.device_id);
                    bluetooth(ble.as_ref(), &route.device)
                }
                _ => wifi(&cloud, &route.device),
            };
            Some(stream)
        })
    }

    /// Checked stream that always uses the cloud, following the selection.
    fn cloud_routed<T, W>(&self, function: &str, wifi: W) -> MetricStream<T>
    where
        T: Send + 'static,
        W: Fn(&CloudClient, &DeviceInfo) -> MetricStream<T> + Send + 'static,
    {
        if let Err(e) = self.check(function, None) {
            return error_stream(e);
        }
        let cloud = self.cloud.clone();
        switch_map(self.selected.subscribe(), move |device: &Option<DeviceInfo>| {
            device.as_ref().map(|d| wifi(&cloud, d))
        })
    }

    // ── Metrics ───────────────────────────────────────────────────────────────

    pub fn status(&self) -> MetricStream<DeviceStatus> {
        self.routed(
            "status",
            None,
            |cloud, device| cloud.status(&device.device_id),
            |ble, _| decode(ble.json_metric(characteristic::STATUS)),
        )
    }

    pub fn settings(&self) -> MetricStream<Settings> {
        self.routed(
            "settings",
            None,
            |cloud, device| {
                decode(
                    cloud
                        .transport()
                        .observe_namespace(&device.device_id, SETTINGS_NAMESPACE),
                )
            },
            |ble, _| decode(ble.json_metric(characteristic::SETTINGS)),
        )
    }

    pub fn signal_quality(&self) -> MetricStream<SignalQuality> {
        self.routed(
            "signal_quality",
            None,
            |cloud, device| decode(cloud.metric(&device.device_id, "signalQuality", &[], true)),
            |ble, _| decode(ble.json_metric(characteristic::SIGNAL_QUALITY)),
        )
    }

    pub fn accelerometer(&self) -> MetricStream<Accelerometer> {
        self.routed(
            "accelerometer",
            Some(Feature::Accelerometer),
            |cloud, device| decode(cloud.metric(&device.device_id, "accelerometer", &[], true)),
            |ble, _| decode(ble.json_metric(characteristic::ACCELEROMETER)),
        )
    }

    /// `raw` and `rawUnfiltered` yield epochs; `psd` and `powerByBand` yield
    /// their JSON payloads.
    pub fn brainwaves(&self, label: &str) -> MetricStream<Brainwaves> {
        if !BRAINWAVES_LABELS.contains(&label) {
            return error_stream(SdkError::InvalidArgument(format!(
                "unknown brainwaves label {label:?}, expected one of {}",
                BRAINWAVES_LABELS.join(", ")
            )));
        }
        let label = label.to_owned();
        let epochs = is_epoch_label(&label);
        let (wifi_label, ble_label) = (label.clone(), label);
        self.routed(
            "brainwaves",
            None,
            move |cloud, device| {
                let values = cloud.metric(&device.device_id, "brainwaves", &[wifi_label.as_str()], false);
                if epochs {
                    decode::<Epoch>(values).map_ok(Brainwaves::Epoch).boxed()
                } else {
                    values.map_ok(Brainwaves::Json).boxed()
                }
            },
            move |ble, _| {
                if epochs {
                    ble.epochs(&ble_label).map_ok(Brainwaves::Epoch).boxed()
                } else {
                    ble.json_metric(&ble_label).map_ok(Brainwaves::Json).boxed()
                }
            },
        )
    }

    pub fn calm(&self) -> MetricStream<Probability> {
        self.awareness("calm", characteristic::CALM)
    }

    pub fn focus(&self) -> MetricStream<Probability> {
        self.awareness("focus", characteristic::FOCUS)
    }

    fn awareness(&self, label: &'static str, ble_characteristic: &'static str) -> MetricStream<Probability> {
        self.routed(
            label,
            None,
            move |cloud, device| decode(cloud.metric(&device.device_id, "awareness", &[label], false)),
            move |ble, _| decode(ble.json_metric(ble_characteristic)),
        )
    }

    /// Kinesis events for one trained thought.  Cloud only.
    pub fn kinesis(&self, label: &str) -> MetricStream<Prediction> {
        let label = label.to_owned();
        self.cloud_routed("kinesis", move |cloud, device| {
            decode(cloud.metric(&device.device_id, "kinesis", &[label.as_str()], false))
        })
    }

    /// Raw predictions for one trained thought.  Cloud only.
    pub fn predictions(&self, label: &str) -> MetricStream<Prediction> {
        let label = label.to_owned();
        self.cloud_routed("predictions", move |cloud, device| {
            decode(cloud.metric(&device.device_id, "predictions", &[label.as_str()], false))
        })
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Dispatch on the transport the selector picks right now.
    async fn dispatch(&self, device: &DeviceInfo, action: Action) -> SdkResult<Value> {
        let mode = self.selector.current().active_mode;
        match (mode, &self.bluetooth) {
            (ActiveMode::Bluetooth, Some(ble)) => ble.dispatch_action(action).await,
            _ => {
                self.cloud
                    .transport()
                    .dispatch_action(&device.device_id, action)
                    .await
            }
        }
    }

    /// Stamp a marker into the recording.
    pub async fn add_marker(&self, label: &str) -> SdkResult<()> {
        let device = self.check("add_marker", None)?;
        if label.trim().is_empty() {
            return Err(SdkError::InvalidArgument("marker label must not be empty".into()));
        }
        let action = Action::new("marker", "add").with_message(json!({
            "label": label,
            "timestamp": now_ms(),
        }));
        self.dispatch(&device, action).await.map(|_| ())
    }

    /// Queue haptic effects, keyed by motor (`P7`, `P8`).
    pub async fn haptics(&self, effects: &BTreeMap<String, Vec<String>>) -> SdkResult<Value> {
        let device = self.check("haptics", Some(Feature::Haptics))?;
        validate_haptics(effects)?;
        let action = Action::new("haptics", "queue")
            .with_message(json!({ "effects": effects }))
            .with_response(HAPTICS_RESPONSE_TIMEOUT);
        self.dispatch(&device, action).await
    }

    /// Change the settings that are set in `settings`; unset fields are left
    /// untouched.
    pub async fn change_settings(&self, settings: &Settings) -> SdkResult<()> {
        let device = self.check("change_settings", None)?;
        let mut message = serde_json::to_value(settings)?;
        if let Value::Object(fields) = &mut message {
            fields.retain(|_, v| !v.is_null());
            if fields.is_empty() {
                return Err(SdkError::InvalidArgument("no settings to change".into()));
            }
        }
        let action = Action::new("settings", "change").with_message(message);
        self.dispatch(&device, action).await.map(|_| ())
    }

    pub fn training(&self) -> Training<'_> {
        Training { client: self }
    }

    // ── OAuth ─────────────────────────────────────────────────────────────────

    pub async fn create_oauth_url(&self, config: &OAuthUrlConfig) -> SdkResult<String> {
        self.ensure_server("create_oauth_url")?;
        self.cloud.transport().create_oauth_url(config).await
    }

    pub async fn get_oauth_token(&self, query: &OAuthQuery) -> SdkResult<Value> {
        self.ensure_server("get_oauth_token")?;
        self.cloud.transport().get_oauth_token(query).await
    }

    pub async fn remove_oauth_access(&self) -> SdkResult<()> {
        self.ensure_server("remove_oauth_access")?;
        self.cloud.transport().remove_oauth_access().await
    }
}

impl Drop for NeurosityClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── Training ──────────────────────────────────────────────────────────────────

/// Kinesis training commands.  Training data lives in the cloud, so these
/// always go through the cloud transport.
pub struct Training<'a> {
    client: &'a NeurosityClient,
}

impl Training<'_> {
    async fn send(&self, action: &str, message: Value) -> SdkResult<()> {
        let device = self.client.check("training", None)?;
        let action = Action::new("training", action).with_message(message);
        self.client
            .cloud
            .transport()
            .dispatch_action(&device.device_id, action)
            .await
            .map(|_| ())
    }

    pub async fn record(&self, options: &TrainingOptions) -> SdkResult<()> {
        self.send("record", training_message(options)?).await
    }

    pub async fn stop(&self, options: &TrainingOptions) -> SdkResult<()> {
        self.send("stop", training_message(options)?).await
    }

    pub async fn stop_all(&self) -> SdkResult<()> {
        self.send("stopAll", json!({})).await
    }
}

fn training_message(options: &TrainingOptions) -> SdkResult<Value> {
    if options.metric.is_empty() || options.label.is_empty() {
        return Err(SdkError::InvalidArgument(
            "training needs both a metric and a label".into(),
        ));
    }
    let mut message = serde_json::to_value(options)?;
    if let Value::Object(fields) = &mut message {
        fields.insert("timestamp".into(), json!(now_ms()));
    }
    Ok(message)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn decode<T>(values: MetricStream<Value>) -> MetricStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    values
        .and_then(|value| future::ready(serde_json::from_value(value).map_err(SdkError::from)))
        .boxed()
}

fn is_epoch_label(label: &str) -> bool {
    label == characteristic::RAW || label == characteristic::RAW_UNFILTERED
}

fn validate_haptics(effects: &BTreeMap<String, Vec<String>>) -> SdkResult<()> {
    if effects.is_empty() {
        return Err(SdkError::InvalidArgument("no haptic effects given".into()));
    }
    for (motor, queue) in effects {
        if !HAPTIC_MOTORS.contains(&motor.as_str()) {
            return Err(SdkError::InvalidArgument(format!(
                "unknown haptic motor {motor:?}, expected one of {}",
                HAPTIC_MOTORS.join(", ")
            )));
        }
        if queue.len() > MAX_HAPTIC_EFFECTS {
            return Err(SdkError::InvalidArgument(format!(
                "motor {motor} accepts at most {MAX_HAPTIC_EFFECTS} effects, got {}",
                queue.len()
            )));
        }
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Authenticate the BLE link with a cloud-issued token every time it
/// reaches CONNECTED.
async fn authenticate_on_connect(
    cloud: CloudClient,
    ble: Arc<dyn BluetoothTransport>,
    selected: watch::Receiver<Option<DeviceInfo>>,
) {
    let mut connection = ble.connection();
    loop {
        let state = *connection.borrow_and_update();
        if state == ConnectionState::Connected {
            let device = selected.borrow().clone();
            let authenticated = *ble.authenticated().borrow();
            match device {
                Some(device) if !authenticated => {
                    match authenticate_bluetooth(&cloud, ble.as_ref(), &device.device_id).await {
                        Ok(true) => info!("bluetooth: authenticated with {}", device.device_id),
                        Ok(false) => warn!("bluetooth: {} rejected the token", device.device_id),
                        Err(e) => warn!("bluetooth: authentication failed: {e}"),
                    }
                }
                Some(_) => {}
                None => debug!("bluetooth: connected without a selected device, not authenticating"),
            }
        }
        if connection.changed().await.is_err() {
            break;
        }
    }
}

async fn authenticate_bluetooth(
    cloud: &CloudClient,
    ble: &dyn BluetoothTransport,
    device_id: &str,
) -> SdkResult<bool> {
    if ble.is_authenticated().await? {
        return Ok(true);
    }
    let token = cloud.transport().create_bluetooth_token(device_id).await?;
    ble.authenticate(&token).await
}
