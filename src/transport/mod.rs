//! Bluetooth transport layer.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`platform`] | capability interface a BLE binding implements |
//! | [`bluetooth`] | connection state machine, handle map, stitching, correlation, reconnection |
//! | [`mock`] | in-memory platform for tests and simulators |
//! | `native` | btleplug binding (feature `native`) |
//!
//! The facade only ever sees `Arc<dyn BluetoothTransport>`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{SdkError, SdkResult};
use crate::stream::MetricStream;
use crate::types::{Action, ConnectionState, DeviceInfo, Epoch};

pub mod bluetooth;
pub mod mock;
#[cfg(feature = "native")]
pub mod native;
pub mod platform;

pub use bluetooth::{BluetoothClient, BluetoothConfig};
pub use platform::{BlePlatform, DiscoveredDevice, Discovery, Notification, ScanFilter};

/// One decoded unit from a characteristic subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A stitched packet parsed as JSON.
    Json(Value),
    /// A stitched packet left as text (`skip_json_decoding`).
    Text(String),
    /// A raw notification from a binary characteristic.
    Bytes(Vec<u8>),
}

impl Packet {
    pub fn into_json(self) -> SdkResult<Value> {
        match self {
            Packet::Json(value) => Ok(value),
            Packet::Text(text) => Ok(Value::String(text)),
            Packet::Bytes(_) => Err(SdkError::InvalidArgument(
                "binary characteristics have no JSON form".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    /// Logical characteristic name, see [`crate::protocol::characteristic`].
    pub name: String,
    /// Start notifications on subscribe and stop them on drop.  Leave off
    /// when something else owns the notification state of the
    /// characteristic.
    pub manage_notifications: bool,
    pub skip_json_decoding: bool,
}

impl SubscribeOptions {
    pub fn managed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manage_notifications: true,
            skip_json_decoding: false,
        }
    }

    pub fn unmanaged(name: impl Into<String>) -> Self {
        Self {
            manage_notifications: false,
            ..Self::managed(name)
        }
    }
}

/// The BLE capability contract the facade and the streaming-mode selector
/// depend on.
#[async_trait]
pub trait BluetoothTransport: Send + Sync {
    /// Replayed, distinct connection state.
    fn connection(&self) -> watch::Receiver<ConnectionState>;

    /// Append-only diagnostic log of this transport.
    fn logs(&self) -> BoxStream<'static, String>;

    /// Continuously updated list of nearby headsets.  `None` when the
    /// platform has no scan capability (browser picker).
    fn scan(&self, filter: Option<ScanFilter>) -> Option<MetricStream<Vec<DiscoveredDevice>>>;

    /// Connect to `device`, or discover one when `None`.
    async fn connect(&self, device: Option<DiscoveredDevice>) -> SdkResult<()>;

    /// Caller-initiated disconnect; never triggers auto-reconnect.
    async fn disconnect(&self) -> SdkResult<()>;

    async fn read_characteristic(&self, name: &str) -> SdkResult<Vec<u8>>;

    async fn write_characteristic(&self, name: &str, data: &[u8]) -> SdkResult<()>;

    async fn subscribe_to_characteristic(&self, options: SubscribeOptions) -> SdkResult<MetricStream<Packet>>;

    /// Dispatch a command on the `actions` characteristic.
    async fn dispatch_action(&self, action: Action) -> SdkResult<Value>;

    /// Authenticate the link with a cloud-issued token.
    async fn authenticate(&self, token: &str) -> SdkResult<bool>;

    async fn is_authenticated(&self) -> SdkResult<bool>;

    fn authenticated(&self) -> watch::Receiver<bool>;

    /// Follow the facade's selected device (nickname for reconnection,
    /// channel layout for epochs, auto-connect).
    fn attach_device(&self, device: watch::Receiver<Option<DeviceInfo>>);

    /// Shared, authentication-gated JSON metric stream for a characteristic.
    fn json_metric(&self, characteristic: &str) -> MetricStream<Value>;

    /// Shared, authentication-gated epoch stream for a binary characteristic.
    fn epochs(&self, characteristic: &str) -> MetricStream<Epoch>;

    fn pending_actions(&self) -> watch::Receiver<BTreeSet<String>>;
}
