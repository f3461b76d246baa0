//! btleplug binding (CoreBluetooth / BlueZ / WinRT).
//!
//! Discovery runs repeated scan windows on the first adapter.  Link loss is
//! detected from the adapter's `DeviceDisconnected` events, which fire faster
//! than the notification stream closing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter as BtScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::platform::{BlePlatform, DiscoveredDevice, Discovery, Notification, ScanFilter};
use crate::error::{SdkError, SdkResult};
use crate::protocol::PRIMARY_SERVICE_UUID;

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

fn platform_error(e: btleplug::Error) -> SdkError {
    SdkError::Platform(e.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Link {
    peripheral: Option<Peripheral>,
    pump: Option<JoinHandle<()>>,
}

struct Shared {
    /// Peripherals seen by any scan window, by platform id string.
    seen: Mutex<HashMap<String, Peripheral>>,
    link: Mutex<Link>,
    connected_id: Mutex<Option<PeripheralId>>,
    notifications: broadcast::Sender<Notification>,
    disconnections: broadcast::Sender<()>,
}

/// [`BlePlatform`] on the host Bluetooth stack.
pub struct NativePlatform {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl NativePlatform {
    /// Open the first Bluetooth adapter and start watching its events.
    pub async fn new() -> SdkResult<Self> {
        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next()
            .ok_or_else(|| SdkError::Platform("no Bluetooth adapter found".into()))?;

        wait_powered_on(&adapter).await;

        let shared = Arc::new(Shared {
            seen: Mutex::new(HashMap::new()),
            link: Mutex::new(Link::default()),
            connected_id: Mutex::new(None),
            notifications: broadcast::channel(1024).0,
            disconnections: broadcast::channel(16).0,
        });

        let mut events = adapter.events().await.map_err(platform_error)?;
        let watcher = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else { continue };
                let Some(shared) = watcher.upgrade() else { break };
                let ours = lock(&shared.connected_id).as_ref() == Some(&id);
                if ours {
                    info!("native: device {id:?} disconnected");
                    *lock(&shared.connected_id) = None;
                    let _ = shared.disconnections.send(());
                }
            }
            debug!("native: adapter event stream ended");
        });

        Ok(Self { adapter, shared })
    }

    fn peripheral(&self) -> SdkResult<Peripheral> {
        lock(&self.shared.link)
            .peripheral
            .clone()
            .ok_or_else(|| SdkError::Platform("no peripheral connected".into()))
    }
}

/// CoreBluetooth starts in an unknown state and silently ignores scans until
/// it reports powered on.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                log::warn!("native: adapter still {state:?} after 3 s, continuing");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("native: adapter_state() failed: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

#[async_trait]
impl BlePlatform for NativePlatform {
    type Handle = Characteristic;

    fn discovery(&self) -> Discovery {
        Discovery::Scan
    }

    async fn scan_window(&self, filter: &ScanFilter, window: Duration) -> SdkResult<Vec<DiscoveredDevice>> {
        self.adapter
            .start_scan(BtScanFilter::default())
            .await
            .map_err(platform_error)?;
        tokio::time::sleep(window).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("native: stop_scan failed: {e}");
        }

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(platform_error)? {
            let Ok(Some(props)) = peripheral.properties().await else { continue };
            let device = DiscoveredDevice {
                id: peripheral.id().to_string(),
                name: props.local_name.unwrap_or_default(),
                manufacturer_data: props.manufacturer_data,
                rssi: props.rssi,
            };
            if !filter.matches(&device) {
                continue;
            }
            lock(&self.shared.seen).insert(device.id.clone(), peripheral);
            found.push(device);
        }
        debug!("native: scan window saw {} headset(s)", found.len());
        Ok(found)
    }

    async fn connect(&self, device: &DiscoveredDevice) -> SdkResult<()> {
        let peripheral = lock(&self.shared.seen)
            .get(&device.id)
            .cloned()
            .ok_or_else(|| SdkError::Platform(format!("{} was not seen by a scan", device.name)))?;

        peripheral.connect().await.map_err(platform_error)?;

        // BlueZ reports the connection before the remote GATT cache is
        // populated; discovering too early returns an empty table.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        let mut notifications = peripheral.notifications().await.map_err(platform_error)?;
        let tx = self.shared.notifications.clone();
        let pump = tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let _ = tx.send(Notification {
                    uuid: n.uuid,
                    value: n.value,
                });
            }
            debug!("native: notification stream ended");
        });

        *lock(&self.shared.connected_id) = Some(peripheral.id());
        let mut link = lock(&self.shared.link);
        if let Some(old) = link.pump.replace(pump) {
            old.abort();
        }
        link.peripheral = Some(peripheral);
        Ok(())
    }

    async fn discover(&self) -> SdkResult<Vec<(Uuid, Characteristic)>> {
        let peripheral = self.peripheral()?;
        tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| SdkError::Platform("service discovery timed out after 15 s".into()))?
            .map_err(platform_error)?;
        Ok(peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == PRIMARY_SERVICE_UUID)
            .map(|c| (c.uuid, c))
            .collect())
    }

    async fn request_mtu(&self, _mtu: u16) -> SdkResult<Option<u16>> {
        // btleplug leaves MTU exchange to the OS stack.
        Err(SdkError::NotAvailable("MTU request".into()))
    }

    async fn disconnect(&self) -> SdkResult<()> {
        let (peripheral, pump) = {
            let mut link = lock(&self.shared.link);
            (link.peripheral.take(), link.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        match peripheral {
            Some(p) => p.disconnect().await.map_err(platform_error),
            None => Ok(()),
        }
    }

    async fn read(&self, handle: &Characteristic) -> SdkResult<Vec<u8>> {
        self.peripheral()?.read(handle).await.map_err(platform_error)
    }

    async fn write(&self, handle: &Characteristic, data: &[u8]) -> SdkResult<()> {
        self.peripheral()?
            .write(handle, data, WriteType::WithResponse)
            .await
            .map_err(platform_error)
    }

    async fn start_notifications(&self, handle: &Characteristic) -> SdkResult<()> {
        self.peripheral()?.subscribe(handle).await.map_err(platform_error)
    }

    async fn stop_notifications(&self, handle: &Characteristic) -> SdkResult<()> {
        self.peripheral()?.unsubscribe(handle).await.map_err(platform_error)
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }

    fn disconnections(&self) -> broadcast::Receiver<()> {
        self.shared.disconnections.subscribe()
    }
}
