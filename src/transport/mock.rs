//! In-memory [`BlePlatform`] for tests and simulators.
//!
//! Behaves like a single headset that only notifies on characteristics whose
//! notifications were started, records every write, counts every call, and
//! can drop the link on demand.  An optional responder turns writes into
//! notifications so request/response exchanges can be simulated.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::platform::{BlePlatform, DiscoveredDevice, Discovery, Notification, ScanFilter};
use crate::error::{SdkError, SdkResult};
use crate::protocol::{characteristic_name, characteristic_uuid, CHARACTERISTICS};

type Responder = Box<dyn Fn(&str, &[u8]) -> Vec<(String, Vec<u8>)> + Send + Sync>;

#[derive(Default)]
struct Calls {
    scans: usize,
    requests: usize,
    connects: usize,
    disconnects: usize,
    mtu_requests: usize,
    starts: HashMap<Uuid, usize>,
    stops: HashMap<Uuid, usize>,
}

struct State {
    discovery: Discovery,
    devices: Mutex<Vec<DiscoveredDevice>>,
    characteristics: Mutex<Vec<Uuid>>,
    reads: Mutex<HashMap<Uuid, Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    notifying: Mutex<HashSet<Uuid>>,
    calls: Mutex<Calls>,
    connected: AtomicBool,
    fail_connects: AtomicUsize,
    refuse_notifications: AtomicBool,
    connect_delay: Mutex<Duration>,
    mtu: Mutex<Option<u16>>,
    responder: Mutex<Option<Responder>>,
    notifications: broadcast::Sender<Notification>,
    disconnections: broadcast::Sender<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn uuid_of(name: &str) -> SdkResult<Uuid> {
    characteristic_uuid(name).ok_or_else(|| SdkError::CharacteristicNotFound(name.to_owned()))
}

/// A simulated headset.  Clones share state.
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<State>,
}

impl MockPlatform {
    /// A platform exposing every known characteristic and no devices.
    pub fn new(discovery: Discovery) -> Self {
        Self {
            state: Arc::new(State {
                discovery,
                devices: Mutex::new(Vec::new()),
                characteristics: Mutex::new(CHARACTERISTICS.iter().map(|(_, uuid)| *uuid).collect()),
                reads: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
                notifying: Mutex::new(HashSet::new()),
                calls: Mutex::new(Calls::default()),
                connected: AtomicBool::new(false),
                fail_connects: AtomicUsize::new(0),
                refuse_notifications: AtomicBool::new(false),
                connect_delay: Mutex::new(Duration::ZERO),
                mtu: Mutex::new(None),
                responder: Mutex::new(None),
                notifications: broadcast::channel(1024).0,
                disconnections: broadcast::channel(16).0,
            }),
        }
    }

    /// Make a headset visible to scans and the picker.
    pub fn with_device(self, name: &str) -> Self {
        lock(&self.state.devices).push(DiscoveredDevice {
            id: format!("mock-{name}"),
            name: name.to_owned(),
            manufacturer_data: HashMap::new(),
            rssi: Some(-50),
        });
        self
    }

    /// Remove characteristics from the GATT table seen on the next discovery.
    pub fn without_characteristics(self, names: &[&str]) -> Self {
        lock(&self.state.characteristics)
            .retain(|uuid| !characteristic_name(uuid).is_some_and(|n| names.contains(&n)));
        self
    }

    /// MTU reported by `request_mtu`; `None` means platform-negotiated.
    pub fn with_mtu(self, mtu: Option<u16>) -> Self {
        *lock(&self.state.mtu) = mtu;
        self
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make every `start_notifications` call fail while set.
    pub fn refuse_notifications(&self, refuse: bool) {
        self.state.refuse_notifications.store(refuse, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.state.connect_delay) = delay;
    }

    pub fn set_read(&self, name: &str, value: impl Into<Vec<u8>>) {
        if let Ok(uuid) = uuid_of(name) {
            lock(&self.state.reads).insert(uuid, value.into());
        }
    }

    /// Turn writes into notifications: `(characteristic, bytes)` pairs
    /// returned by `f` are notified right after the write.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&str, &[u8]) -> Vec<(String, Vec<u8>)> + Send + Sync + 'static,
    {
        *lock(&self.state.responder) = Some(Box::new(f));
    }

    /// Emit a notification.  Returns `false` (and drops it) when
    /// notifications are off for that characteristic.
    pub fn notify(&self, name: &str, value: impl Into<Vec<u8>>) -> bool {
        let Ok(uuid) = uuid_of(name) else { return false };
        if !self.state.connected.load(Ordering::SeqCst) || !lock(&self.state.notifying).contains(&uuid) {
            return false;
        }
        let _ = self.state.notifications.send(Notification {
            uuid,
            value: value.into(),
        });
        true
    }

    /// Send `text` on a JSON characteristic split into `chunk`-byte
    /// notifications, as the headset does for payloads above the MTU.
    pub fn notify_chunked(&self, name: &str, text: &str, chunk: usize) -> bool {
        text.as_bytes()
            .chunks(chunk.max(1))
            .all(|part| self.notify(name, part.to_vec()))
    }

    /// Simulate an unexpected link loss.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        lock(&self.state.notifying).clear();
        let _ = self.state.disconnections.send(());
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_notifying(&self, name: &str) -> bool {
        uuid_of(name).is_ok_and(|uuid| lock(&self.state.notifying).contains(&uuid))
    }

    /// Everything written to a characteristic, oldest first.
    pub fn writes_to(&self, name: &str) -> Vec<Vec<u8>> {
        let Ok(uuid) = uuid_of(name) else { return Vec::new() };
        lock(&self.state.writes)
            .iter()
            .filter(|(u, _)| *u == uuid)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn start_count(&self, name: &str) -> usize {
        uuid_of(name)
            .map(|uuid| lock(&self.state.calls).starts.get(&uuid).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn stop_count(&self, name: &str) -> usize {
        uuid_of(name)
            .map(|uuid| lock(&self.state.calls).stops.get(&uuid).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state.calls).connects
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.state.calls).disconnects
    }

    pub fn scan_count(&self) -> usize {
        lock(&self.state.calls).scans
    }

    pub fn request_count(&self) -> usize {
        lock(&self.state.calls).requests
    }

    pub fn mtu_request_count(&self) -> usize {
        lock(&self.state.calls).mtu_requests
    }

    fn require_link(&self) -> SdkResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SdkError::Platform("GATT server is disconnected".into()))
        }
    }

    fn visible(&self, filter: &ScanFilter) -> Vec<DiscoveredDevice> {
        lock(&self.state.devices)
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    type Handle = Uuid;

    fn discovery(&self) -> Discovery {
        self.state.discovery
    }

    async fn scan_window(&self, filter: &ScanFilter, window: Duration) -> SdkResult<Vec<DiscoveredDevice>> {
        if self.state.discovery != Discovery::Scan {
            return Err(SdkError::NotAvailable("scan".into()));
        }
        lock(&self.state.calls).scans += 1;
        tokio::time::sleep(window).await;
        Ok(self.visible(filter))
    }

    async fn request_device(&self, filter: &ScanFilter) -> SdkResult<DiscoveredDevice> {
        if self.state.discovery != Discovery::Request {
            return Err(SdkError::NotAvailable("requestDevice".into()));
        }
        lock(&self.state.calls).requests += 1;
        self.visible(filter)
            .into_iter()
            .next()
            .ok_or_else(|| SdkError::Platform("user cancelled the device picker".into()))
    }

    async fn connect(&self, device: &DiscoveredDevice) -> SdkResult<()> {
        lock(&self.state.calls).connects += 1;
        let delay = *lock(&self.state.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .state
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SdkError::Platform(format!("could not connect to {}", device.name)));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn discover(&self) -> SdkResult<Vec<(Uuid, Uuid)>> {
        self.require_link()?;
        Ok(lock(&self.state.characteristics)
            .iter()
            .map(|uuid| (*uuid, *uuid))
            .collect())
    }

    async fn request_mtu(&self, _mtu: u16) -> SdkResult<Option<u16>> {
        lock(&self.state.calls).mtu_requests += 1;
        Ok(*lock(&self.state.mtu))
    }

    async fn disconnect(&self) -> SdkResult<()> {
        lock(&self.state.calls).disconnects += 1;
        if self.state.connected.swap(false, Ordering::SeqCst) {
            lock(&self.state.notifying).clear();
            let _ = self.state.disconnections.send(());
        }
        Ok(())
    }

    async fn read(&self, handle: &Uuid) -> SdkResult<Vec<u8>> {
        self.require_link()?;
        lock(&self.state.reads)
            .get(handle)
            .cloned()
            .ok_or_else(|| SdkError::Platform("read not permitted".into()))
    }

    async fn write(&self, handle: &Uuid, data: &[u8]) -> SdkResult<()> {
        self.require_link()?;
        lock(&self.state.writes).push((*handle, data.to_vec()));
        let replies = match (&*lock(&self.state.responder), characteristic_name(handle)) {
            (Some(responder), Some(name)) => responder(name, data),
            _ => Vec::new(),
        };
        for (name, value) in replies {
            self.notify(&name, value);
        }
        Ok(())
    }

    async fn start_notifications(&self, handle: &Uuid) -> SdkResult<()> {
        self.require_link()?;
        if self.state.refuse_notifications.load(Ordering::SeqCst) {
            return Err(SdkError::Platform("CCCD write rejected".into()));
        }
        *lock(&self.state.calls).starts.entry(*handle).or_default() += 1;
        lock(&self.state.notifying).insert(*handle);
        Ok(())
    }

    async fn stop_notifications(&self, handle: &Uuid) -> SdkResult<()> {
        self.require_link()?;
        *lock(&self.state.calls).stops.entry(*handle).or_default() += 1;
        lock(&self.state.notifying).remove(handle);
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.state.notifications.subscribe()
    }

    fn disconnections(&self) -> broadcast::Receiver<()> {
        self.state.disconnections.subscribe()
    }
}
