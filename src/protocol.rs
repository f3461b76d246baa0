//! GATT UUIDs, logical characteristic names, framing constants and wire
//! helpers for Neurosity headsets.
//!
//! All characteristic UUIDs belong to the vendor namespace
//! `XXXXXXXX-1e6b-4a0e-a1f0-29a1d2b4ef4e`.

use std::time::Duration;

use uuid::Uuid;

use crate::error::SdkResult;
use crate::types::Action;

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service exposed by Crown and Notion headsets.
pub const PRIMARY_SERVICE_UUID: Uuid = Uuid::from_u128(0x4a9b0001_1e6b_4a0e_a1f0_29a1d2b4ef4e);

// ── Characteristics ──────────────────────────────────────────────────────────

/// Logical names used throughout the SDK instead of raw UUIDs.
pub mod characteristic {
    pub const DEVICE_NICKNAME: &str = "deviceNickname";
    pub const STATUS: &str = "status";
    pub const ACTIONS: &str = "actions";
    pub const AUTH: &str = "auth";
    pub const RAW: &str = "raw";
    pub const RAW_UNFILTERED: &str = "rawUnfiltered";
    pub const PSD: &str = "psd";
    pub const POWER_BY_BAND: &str = "powerByBand";
    pub const SIGNAL_QUALITY: &str = "signalQuality";
    pub const ACCELEROMETER: &str = "accelerometer";
    pub const FOCUS: &str = "focus";
    pub const CALM: &str = "calm";
    pub const SETTINGS: &str = "settings";
    pub const WIFI_NEARBY_NETWORKS: &str = "wifiNearbyNetworks";
    pub const WIFI_CONNECTIONS: &str = "wifiConnections";
}

/// Logical name → UUID table.
///
/// | Name | UUID suffix | Payload |
/// |---|---|---|
/// | deviceNickname | 0002 | UTF-8 text |
/// | status | 0003 | delimited JSON |
/// | actions | 0004 | delimited JSON (write + notify) |
/// | auth | 0005 | token write / JSON bool read |
/// | raw | 0006 | binary frames |
/// | rawUnfiltered | 0007 | binary frames |
/// | psd | 0008 | delimited JSON |
/// | powerByBand | 0009 | delimited JSON |
/// | signalQuality | 000a | delimited JSON |
/// | accelerometer | 000b | delimited JSON |
/// | focus | 000c | delimited JSON |
/// | calm | 000d | delimited JSON |
/// | settings | 000e | delimited JSON |
/// | wifiNearbyNetworks | 000f | delimited JSON |
/// | wifiConnections | 0010 | delimited JSON |
pub const CHARACTERISTICS: [(&str, Uuid); 15] = [
    (characteristic::DEVICE_NICKNAME, Uuid::from_u128(0x4a9b0002_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::STATUS, Uuid::from_u128(0x4a9b0003_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::ACTIONS, Uuid::from_u128(0x4a9b0004_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::AUTH, Uuid::from_u128(0x4a9b0005_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::RAW, Uuid::from_u128(0x4a9b0006_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::RAW_UNFILTERED, Uuid::from_u128(0x4a9b0007_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::PSD, Uuid::from_u128(0x4a9b0008_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::POWER_BY_BAND, Uuid::from_u128(0x4a9b0009_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::SIGNAL_QUALITY, Uuid::from_u128(0x4a9b000a_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::ACCELEROMETER, Uuid::from_u128(0x4a9b000b_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::FOCUS, Uuid::from_u128(0x4a9b000c_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::CALM, Uuid::from_u128(0x4a9b000d_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::SETTINGS, Uuid::from_u128(0x4a9b000e_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::WIFI_NEARBY_NETWORKS, Uuid::from_u128(0x4a9b000f_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
    (characteristic::WIFI_CONNECTIONS, Uuid::from_u128(0x4a9b0010_1e6b_4a0e_a1f0_29a1d2b4ef4e)),
];

/// Characteristics whose notifications carry fixed-width binary sample
/// frames instead of delimited JSON.
pub const BINARY_CHARACTERISTICS: [&str; 2] = [characteristic::RAW, characteristic::RAW_UNFILTERED];

/// UUID for a logical characteristic name.
pub fn characteristic_uuid(name: &str) -> Option<Uuid> {
    CHARACTERISTICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, uuid)| *uuid)
}

/// Reverse lookup used while populating the handle map after discovery.
pub fn characteristic_name(uuid: &Uuid) -> Option<&'static str> {
    CHARACTERISTICS
        .iter()
        .find(|(_, u)| u == uuid)
        .map(|(name, _)| *name)
}

// ── Discovery ────────────────────────────────────────────────────────────────

/// Advertised name prefixes of supported headsets.
pub const DEVICE_NAME_PREFIXES: [&str; 2] = ["Crown", "Notion"];

/// Bluetooth SIG company identifier carried in the manufacturer data.
pub const MANUFACTURER_ID: u16 = 0x0bd3;

// ── Framing ──────────────────────────────────────────────────────────────────

/// Marker terminating every logical packet on JSON characteristics.
pub const CHUNK_DELIMITER: &str = "EOF";

/// ATT MTU requested on platforms that let the central negotiate it.
pub const REQUESTED_MTU: u16 = 512;

// ── Sampling ─────────────────────────────────────────────────────────────────

/// Hardware sampling rate assumed when the device does not report one.
pub const DEFAULT_SAMPLING_RATE: f64 = 256.0;

/// Samples per epoch.
pub const EPOCH_DURATION: usize = 16;

/// Samples between the starts of consecutive epochs.
pub const EPOCH_INTERVAL: usize = 16;

// ── Action timeouts ──────────────────────────────────────────────────────────

/// Timeout for short query-style actions.
pub const QUERY_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout applied when an action does not specify one.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Wi-Fi operations wait on the user and the access point.
pub const WIFI_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Haptic effects are acknowledged once queued.
pub const HAPTICS_RESPONSE_TIMEOUT: Duration = Duration::from_secs(4);

// ── Wire helpers ─────────────────────────────────────────────────────────────

/// Serialise an action envelope for the `actions` characteristic.
///
/// The payload is plain UTF-8 JSON; the headset reassembles long writes
/// itself, so no delimiter is appended.
pub fn encode_action(action: &Action) -> SdkResult<Vec<u8>> {
    Ok(serde_json::to_vec(action)?)
}

/// Decode a whole characteristic read as text, replacing invalid UTF-8.
/// Notification fragments go through [`crate::stitch`] instead, which only
/// decodes complete packets.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
