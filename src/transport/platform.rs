//! The BLE capability interface consumed by
//! [`BluetoothClient`](super::bluetooth::BluetoothClient).
//!
//! A platform binding only moves bytes: discovery, GATT connect/discover,
//! characteristic read/write, notification enable/disable, and two broadcast
//! feeds (incoming notifications and link-loss events).  Everything stateful
//! (connection state machine, handle invalidation, stitching, correlation,
//! reconnection) lives in the client on top.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{SdkError, SdkResult};
use crate::protocol::{DEVICE_NAME_PREFIXES, MANUFACTURER_ID};

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    /// Platform identifier (UUID on macOS, MAC address on Linux/Windows).
    pub id: String,
    /// Advertised local name; Neurosity devices advertise their nickname.
    pub name: String,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

/// Which headsets discovery should surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    pub name_prefixes: Vec<String>,
    pub manufacturer_id: Option<u16>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            name_prefixes: DEVICE_NAME_PREFIXES.iter().map(|p| p.to_string()).collect(),
            manufacturer_id: Some(MANUFACTURER_ID),
        }
    }
}

impl ScanFilter {
    /// A device matches on any name prefix or on the manufacturer id.
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        let by_name = self
            .name_prefixes
            .iter()
            .any(|prefix| device.name.starts_with(prefix.as_str()));
        let by_vendor = self
            .manufacturer_id
            .is_some_and(|id| device.manufacturer_data.contains_key(&id));
        by_name || by_vendor
    }
}

/// How a platform finds peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    /// Embedded-native: the central runs repeated scan windows and the
    /// client accumulates results.
    Scan,
    /// Browser: one user-mediated picker returns a single device; there is
    /// no scan API.
    Request,
}

/// A value notification from the peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Platform reference to a resolved characteristic.
    type Handle: Clone + Send + Sync + 'static;

    fn discovery(&self) -> Discovery;

    /// Run one scan window and return what was seen in it.
    /// Only meaningful for [`Discovery::Scan`].
    async fn scan_window(&self, _filter: &ScanFilter, _window: Duration) -> SdkResult<Vec<DiscoveredDevice>> {
        Err(SdkError::NotAvailable("scan".into()))
    }

    /// Ask the user to pick a device.  Only meaningful for
    /// [`Discovery::Request`].
    async fn request_device(&self, _filter: &ScanFilter) -> SdkResult<DiscoveredDevice> {
        Err(SdkError::NotAvailable("requestDevice".into()))
    }

    /// Open the GATT link.
    async fn connect(&self, device: &DiscoveredDevice) -> SdkResult<()>;

    /// Resolve every characteristic of the primary service.
    async fn discover(&self) -> SdkResult<Vec<(Uuid, Self::Handle)>>;

    /// Try to widen the ATT MTU.  `Ok(None)` means the platform negotiates
    /// it on its own.
    async fn request_mtu(&self, _mtu: u16) -> SdkResult<Option<u16>> {
        Ok(None)
    }

    async fn disconnect(&self) -> SdkResult<()>;

    async fn read(&self, handle: &Self::Handle) -> SdkResult<Vec<u8>>;

    async fn write(&self, handle: &Self::Handle, data: &[u8]) -> SdkResult<()>;

    async fn start_notifications(&self, handle: &Self::Handle) -> SdkResult<()>;

    async fn stop_notifications(&self, handle: &Self::Handle) -> SdkResult<()>;

    /// All notifications from the connected peripheral.
    fn notifications(&self) -> broadcast::Receiver<Notification>;

    /// One event per link loss, including ones caused by `disconnect`.
    fn disconnections(&self) -> broadcast::Receiver<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, vendor: Option<u16>) -> DiscoveredDevice {
        DiscoveredDevice {
            id: "id".into(),
            name: name.into(),
            manufacturer_data: vendor.into_iter().map(|v| (v, vec![1])).collect(),
            rssi: Some(-60),
        }
    }

    #[test]
    fn filter_matches_prefix_or_vendor() {
        let f = ScanFilter::default();
        assert!(f.matches(&device("Crown-4F2", None)));
        assert!(f.matches(&device("Notion-77", None)));
        assert!(f.matches(&device("my headset", Some(MANUFACTURER_ID))));
        assert!(!f.matches(&device("Flex-AB12", Some(0x004c))));
    }
}
