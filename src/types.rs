//! Data types produced and consumed by the SDK.
//!
//! JSON-facing types use the headset/cloud camelCase field names and keep any
//! unknown fields in an `extra` map so firmware additions are not lost.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Samples and epochs ───────────────────────────────────────────────────────

/// Per-sample metadata some firmware attaches to individual samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,
}

/// One multi-channel EEG sample.
///
/// Produced once per decoded binary frame (see [`crate::parse::decode_samples`])
/// or once per CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since Unix epoch, as stamped by the headset.
    pub timestamp: u64,
    /// One value per channel, in device channel order.
    pub data: Vec<f64>,
    /// Marker id, `None` when the frame carried marker `0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<SampleInfo>,
}

/// Metadata attached to an [`Epoch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochInfo {
    pub sampling_rate: f64,
    /// Timestamp of the first sample in the window.
    pub start_time: u64,
    pub channel_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notch_frequency: Option<String>,
}

/// A channel-major batch of consecutive samples.
///
/// `data[channel][sample]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub data: Vec<Vec<f64>>,
    pub info: EpochInfo,
}

/// Payloads delivered by `brainwaves(label)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Brainwaves {
    /// `raw` and `rawUnfiltered`.
    Epoch(Epoch),
    /// `psd`, `powerByBand` and any other JSON-shaped label.
    Json(Value),
}

/// Labels accepted by `brainwaves(label)`.
pub const BRAINWAVES_LABELS: [&str; 4] = ["raw", "rawUnfiltered", "psd", "powerByBand"];

// ── Device ───────────────────────────────────────────────────────────────────

/// Snapshot of a claimed device's hardware description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_nickname: String,
    pub channels: usize,
    pub channel_names: Vec<String>,
    pub sampling_rate: Option<f64>,
    pub model_name: String,
    pub model_version: String,
    pub os_version: String,
    pub emulator: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hardware features that only some models carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Accelerometer,
    Haptics,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::Accelerometer => "accelerometer",
            Feature::Haptics => "haptics",
        }
    }

    fn min_model(self) -> u32 {
        match self {
            Feature::Accelerometer => 2,
            Feature::Haptics => 3,
        }
    }
}

/// First OS major version that exposes the BLE GATT service.
const MIN_BLUETOOTH_OS_MAJOR: u32 = 16;
/// First hardware model with a BLE radio wired to the OS.
const MIN_BLUETOOTH_MODEL: u32 = 3;

fn leading_number(s: &str) -> u32 {
    s.trim_start_matches(|c: char| !c.is_ascii_digit())
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

impl DeviceInfo {
    pub fn model_number(&self) -> u32 {
        leading_number(&self.model_version)
    }

    pub fn os_major(&self) -> u32 {
        leading_number(&self.os_version)
    }

    /// `true` when both the hardware model and the installed OS support the
    /// BLE streaming service. Emulators never do.
    pub fn supports_bluetooth(&self) -> bool {
        !self.emulator
            && self.model_number() >= MIN_BLUETOOTH_MODEL
            && self.os_major() >= MIN_BLUETOOTH_OS_MAJOR
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.model_number() >= feature.min_model()
    }
}

/// Live device status (`status` namespace / characteristic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceStatus {
    /// `online`, `offline`, `updating`, `booting`, `shuttingOff`.
    pub state: String,
    pub battery: Option<f64>,
    pub charging: Option<bool>,
    pub sleep_mode: Option<bool>,
    pub ssid: Option<String>,
    pub last_heartbeat: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceStatus {
    pub fn is_online(&self) -> bool {
        !self.state.is_empty() && self.state != "offline"
    }
}

/// Device settings (`settings` namespace / characteristic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub lsl: Option<bool>,
    pub bluetooth: Option<bool>,
    pub timesync: Option<bool>,
    pub device_nickname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Metrics ──────────────────────────────────────────────────────────────────

/// Focus / calm score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Probability {
    pub probability: f64,
    pub label: Option<String>,
    pub metric: Option<String>,
    pub timestamp: Option<u64>,
}

/// Kinesis and prediction events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prediction {
    pub label: String,
    pub metric: Option<String>,
    pub probability: Option<f64>,
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Accelerometer {
    pub acceleration: f64,
    pub inclination: f64,
    pub orientation: f64,
    pub pitch: f64,
    pub roll: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: Option<u64>,
}

/// Signal quality of one electrode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelQuality {
    pub standard_deviation: f64,
    /// `great`, `good`, `bad`, `noContact`.
    pub status: String,
}

pub type SignalQuality = Vec<ChannelQuality>;

// ── Commands ─────────────────────────────────────────────────────────────────

/// Command envelope shared by both transports.
///
/// `action_id` is assigned by the correlator right before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub command: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default)]
    pub response_required: bool,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

impl Action {
    pub fn new(command: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            action: action.into(),
            message: None,
            response_required: false,
            response_timeout: None,
            action_id: None,
        }
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_response(mut self, timeout: std::time::Duration) -> Self {
        self.response_required = true;
        self.response_timeout = Some(timeout.as_millis() as u64);
        self
    }
}

/// Options for `training.record` / `training.stop`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingOptions {
    pub metric: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub fit: bool,
    #[serde(default)]
    pub baseline: bool,
}

// ── BLE connection ───────────────────────────────────────────────────────────

/// BLE link state owned by one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}
