//! BLE transport: connection state machine on top of a [`BlePlatform`].
//!
//! One [`BluetoothClient`] owns one GATT link and everything tied to it:
//!
//! | State | Owner | Invalidated on |
//! |---|---|---|
//! | connection state | `watch` channel | never (replayed) |
//! | characteristic handles | generation-tagged map | every disconnect |
//! | authentication | `watch` channel | every disconnect |
//! | pending actions | [`ActionCorrelator`] | per action |
//! | shared metric streams | [`Multicast`] per characteristic | last subscriber |
//!
//! ## Connection lifecycle
//!
//! ```text
//! DISCONNECTED ──connect()──────────────▶ CONNECTING ──▶ CONNECTED
//! DISCONNECTED ──connect_to_selected()──▶ SCANNING ──▶ CONNECTING ──▶ CONNECTED
//! CONNECTED ──disconnect()──▶ DISCONNECTING ──▶ DISCONNECTED
//! CONNECTED ──link loss──▶ DISCONNECTED ──(one auto-reconnect attempt)──▶ SCANNING …
//! ```
//!
//! Any failure while scanning or connecting returns to DISCONNECTED and is
//! reported to the caller.  A failed auto-reconnect only goes to the log.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use uuid::Uuid;

use super::platform::{BlePlatform, DiscoveredDevice, Discovery, ScanFilter};
use super::{BluetoothTransport, Packet, SubscribeOptions};
use crate::correlator::{ActionChannel, ActionCorrelator};
use crate::epoch::{epochs, EpochOptions};
use crate::error::{SdkError, SdkResult};
use crate::parse::{decode_samples, sample_size};
use crate::protocol::{
    self, characteristic, CHUNK_DELIMITER, DEFAULT_SAMPLING_RATE, DEVICE_NAME_PREFIXES,
    EPOCH_DURATION, EPOCH_INTERVAL, MANUFACTURER_ID, REQUESTED_MTU,
};
use crate::stitch::stitch;
use crate::stream::{
    broadcast_stream, spawn_detached, switch_map, until_error, with_guard, MetricStream, Multicast,
    OnDrop,
};
use crate::types::{Action, ConnectionState, DeviceInfo, Epoch, Sample};

/// How long a response-expecting write waits for `actions` notifications to
/// be confirmed before writing anyway.
const NOTIFY_SETTLE: Duration = Duration::from_secs(2);

const LOG_CAPACITY: usize = 256;

// ── BluetoothConfig ───────────────────────────────────────────────────────────

/// Configuration for [`BluetoothClient`].
#[derive(Debug, Clone)]
pub struct BluetoothConfig {
    /// Advertised name prefixes accepted during discovery.
    /// Default: `["Crown", "Notion"]`.
    pub name_prefixes: Vec<String>,
    /// Manufacturer id accepted during discovery, independent of the name.
    pub manufacturer_id: Option<u16>,
    /// Length of one scan window.  Default: 3 s.
    pub scan_window: Duration,
    /// Give up looking for a headset after this long.  Default: 30 s.
    pub scan_timeout: Duration,
    /// Hard timeout on the GATT connect.  Some stacks block forever when the
    /// device is out of range.  Default: 10 s.
    pub connect_timeout: Duration,
    /// ATT MTU requested on platforms where the central negotiates it.
    pub requested_mtu: u16,
    /// Packet terminator on JSON characteristics.  Default: `"EOF"`.
    pub chunk_delimiter: String,
    /// Gate shared metric streams on `auth` as well as on the link.
    /// Default: `true`.
    pub require_authentication: bool,
    /// Connect as soon as a BLE-capable device is selected.  Default: `true`.
    pub auto_connect: bool,
    /// Make one reconnect attempt after an unexpected link loss.
    /// Default: `true`.
    pub auto_reconnect: bool,
    /// Sampling rate stamped on epochs when no device is selected.
    pub default_sampling_rate: f64,
    /// Channel count used to decode raw frames when no device is selected.
    pub default_channel_count: usize,
    pub epoch_duration: usize,
    pub epoch_interval: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            name_prefixes: DEVICE_NAME_PREFIXES.iter().map(|p| p.to_string()).collect(),
            manufacturer_id: Some(MANUFACTURER_ID),
            scan_window: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            requested_mtu: REQUESTED_MTU,
            chunk_delimiter: CHUNK_DELIMITER.into(),
            require_authentication: true,
            auto_connect: true,
            auto_reconnect: true,
            default_sampling_rate: DEFAULT_SAMPLING_RATE,
            default_channel_count: 8,
            epoch_duration: EPOCH_DURATION,
            epoch_interval: EPOCH_INTERVAL,
        }
    }
}

impl BluetoothConfig {
    pub fn filter(&self) -> ScanFilter {
        ScanFilter {
            name_prefixes: self.name_prefixes.clone(),
            manufacturer_id: self.manufacturer_id,
        }
    }
}

// ── Handle map ────────────────────────────────────────────────────────────────

/// A characteristic handle stamped with the link generation it belongs to.
#[derive(Clone)]
struct Resolved<H> {
    name: &'static str,
    uuid: Uuid,
    handle: H,
    generation: u64,
}

/// Logical name → platform handle, valid for one link only.
struct HandleMap<H> {
    generation: u64,
    entries: HashMap<&'static str, (Uuid, H)>,
}

impl<H: Clone> HandleMap<H> {
    fn new() -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&self, name: &str) -> SdkResult<Resolved<H>> {
        self.entries
            .get_key_value(name)
            .map(|(name, (uuid, handle))| Resolved {
                name,
                uuid: *uuid,
                handle: handle.clone(),
                generation: self.generation,
            })
            .ok_or_else(|| SdkError::CharacteristicNotFound(name.to_owned()))
    }

    /// Start a new generation from a discovery result.  Unknown UUIDs are
    /// ignored.  Returns how many known characteristics were found.
    fn populate(&mut self, discovered: Vec<(Uuid, H)>) -> usize {
        self.invalidate();
        for (uuid, handle) in discovered {
            if let Some(name) = protocol::characteristic_name(&uuid) {
                self.entries.insert(name, (uuid, handle));
            }
        }
        self.entries.len()
    }

    fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.entries.clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_flag(tx: &watch::Sender<bool>, value: bool) -> bool {
    tx.send_if_modified(|v| {
        if *v == value {
            false
        } else {
            *v = value;
            true
        }
    })
}

/// Strip the platform error wrapper so read/write errors read naturally.
fn platform_message(e: SdkError) -> String {
    match e {
        SdkError::Platform(message) => message,
        other => other.to_string(),
    }
}

// ── Inner ─────────────────────────────────────────────────────────────────────

struct Inner<P: BlePlatform> {
    platform: P,
    config: BluetoothConfig,
    connection: watch::Sender<ConnectionState>,
    authenticated: watch::Sender<bool>,
    /// `connected && (authenticated || !require_authentication)`.
    ready: watch::Sender<bool>,
    handles: Mutex<HandleMap<P::Handle>>,
    correlator: ActionCorrelator,
    actions_notifying: watch::Sender<bool>,
    logs: broadcast::Sender<String>,
    auto_reconnect: AtomicBool,
    selected_device: watch::Sender<Option<DeviceInfo>>,
    last_device: Mutex<Option<DiscoveredDevice>>,
    json_metrics: Mutex<HashMap<String, Multicast<Value>>>,
    epoch_metrics: Mutex<HashMap<String, Multicast<Epoch>>>,
}

impl<P: BlePlatform> Inner<P> {
    fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("bluetooth: {line}");
        let _ = self.logs.send(line);
    }

    fn state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.connection.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            self.log(format!("connection state: {next:?}"));
            self.refresh_ready();
        }
    }

    /// Move from `from` to `to` only if nothing else moved the state since.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> SdkResult<()> {
        let moved = self.connection.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(SdkError::NotConnected);
        }
        self.log(format!("connection state: {to:?}"));
        self.refresh_ready();
        Ok(())
    }

    /// Start a connection attempt from DISCONNECTED.  Already connected is a
    /// no-op; any other state means an attempt is in flight.
    fn claim(&self, next: ConnectionState) -> SdkResult<bool> {
        match self.advance(ConnectionState::Disconnected, next) {
            Ok(()) => Ok(true),
            Err(_) if self.state() == ConnectionState::Connected => Ok(false),
            Err(_) => Err(SdkError::Busy),
        }
    }

    fn set_authenticated(&self, value: bool) {
        if set_flag(&self.authenticated, value) {
            self.log(format!("authenticated: {value}"));
            self.refresh_ready();
        }
    }

    fn refresh_ready(&self) {
        let ready = self.state() == ConnectionState::Connected
            && (*self.authenticated.borrow() || !self.config.require_authentication);
        set_flag(&self.ready, ready);
    }

    fn resolve(&self, name: &str) -> SdkResult<Resolved<P::Handle>> {
        let resolved = lock(&self.handles).get(name)?;
        if self.state() != ConnectionState::Connected {
            return Err(SdkError::NotConnected);
        }
        Ok(resolved)
    }

    fn is_current(&self, resolved: &Resolved<P::Handle>) -> bool {
        lock(&self.handles).generation == resolved.generation
    }

    fn mark_disconnected(&self) {
        lock(&self.handles).invalidate();
        set_flag(&self.actions_notifying, false);
        self.set_authenticated(false);
        self.set_state(ConnectionState::Disconnected);
    }

    // ── Connect ───────────────────────────────────────────────────────────────

    async fn connect(&self, device: Option<DiscoveredDevice>) -> SdkResult<()> {
        if !self.claim(ConnectionState::Connecting)? {
            return Ok(());
        }
        let attempt = async {
            let device = match device {
                Some(device) => device,
                None => self.discover_any().await?,
            };
            self.establish(device).await
        };
        let result = attempt.await;
        self.settle(result)
    }

    async fn connect_to_selected(&self) -> SdkResult<()> {
        let device = self
            .selected_device
            .borrow()
            .clone()
            .ok_or_else(|| SdkError::NoDeviceSelected("connect".into()))?;
        if !device.supports_bluetooth() {
            return Err(SdkError::Unsupported {
                feature: "bluetooth".into(),
                model_version: device.model_version,
            });
        }
        if !self.claim(ConnectionState::Scanning)? {
            return Ok(());
        }
        let attempt = async {
            let target = self.find_selected(&device.device_nickname).await?;
            self.advance(ConnectionState::Scanning, ConnectionState::Connecting)?;
            self.establish(target).await
        };
        let result = attempt.await;
        self.settle(result)
    }

    fn settle(&self, result: SdkResult<()>) -> SdkResult<()> {
        if let Err(e) = &result {
            self.log(format!("connection attempt failed: {e}"));
            lock(&self.handles).invalidate();
            self.set_state(ConnectionState::Disconnected);
        }
        result
    }

    async fn discover_any(&self) -> SdkResult<DiscoveredDevice> {
        let filter = self.config.filter();
        match self.platform.discovery() {
            Discovery::Request => self.platform.request_device(&filter).await,
            Discovery::Scan => self.scan_until(&filter, |_| true).await,
        }
    }

    async fn find_selected(&self, nickname: &str) -> SdkResult<DiscoveredDevice> {
        match self.platform.discovery() {
            Discovery::Scan => {
                let filter = self.config.filter();
                self.scan_until(&filter, |d| d.name == nickname).await
            }
            Discovery::Request => {
                // The picker needs a user gesture, so reuse a device the user
                // already granted when it is the selected one.
                let known = lock(&self.last_device).clone();
                if let Some(device) = known.filter(|d| d.name == nickname) {
                    return Ok(device);
                }
                let filter = ScanFilter {
                    name_prefixes: vec![nickname.to_owned()],
                    manufacturer_id: None,
                };
                self.platform.request_device(&filter).await
            }
        }
    }

    async fn scan_until<F>(&self, filter: &ScanFilter, accept: F) -> SdkResult<DiscoveredDevice>
    where
        F: Fn(&DiscoveredDevice) -> bool + Send + Sync,
    {
        let deadline = tokio::time::Instant::now() + self.config.scan_timeout;
        loop {
            let seen = self.platform.scan_window(filter, self.config.scan_window).await?;
            if let Some(device) = seen.into_iter().find(|d| filter.matches(d) && accept(d)) {
                self.log(format!("found {} ({})", device.name, device.id));
                return Ok(device);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SdkError::Platform(format!(
                    "no matching headset found within {} s",
                    self.config.scan_timeout.as_secs()
                )));
            }
        }
    }

    async fn establish(&self, device: DiscoveredDevice) -> SdkResult<()> {
        self.log(format!("connecting to {} ({})", device.name, device.id));
        tokio::time::timeout(self.config.connect_timeout, self.platform.connect(&device))
            .await
            .map_err(|_| {
                SdkError::Platform(format!(
                    "connect timed out after {} s",
                    self.config.connect_timeout.as_secs()
                ))
            })??;

        let opened = async {
            self.open_gatt(&device).await?;
            *lock(&self.last_device) = Some(device.clone());
            self.advance(ConnectionState::Connecting, ConnectionState::Connected)
        };
        match opened.await {
            Ok(()) => {
                info!("bluetooth: connected to {}", device.name);
                Ok(())
            }
            Err(e) => {
                if let Err(close) = self.platform.disconnect().await {
                    self.log(format!("closing half-open link failed: {close}"));
                }
                Err(e)
            }
        }
    }

    async fn open_gatt(&self, device: &DiscoveredDevice) -> SdkResult<()> {
        let discovered = self.platform.discover().await?;
        let known = lock(&self.handles).populate(discovered);
        if known == 0 {
            return Err(SdkError::Platform(format!(
                "{} exposes no Neurosity characteristics",
                device.name
            )));
        }
        self.log(format!("resolved {known} characteristic(s)"));

        if self.platform.discovery() == Discovery::Scan {
            match self.platform.request_mtu(self.config.requested_mtu).await {
                Ok(Some(mtu)) => self.log(format!("MTU set to {mtu}")),
                Ok(None) => self.log("MTU is negotiated by the platform"),
                Err(e) => self.log(format!("MTU request failed: {e}")),
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> SdkResult<()> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let previous = self.auto_reconnect.swap(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnecting);
        let result = self.platform.disconnect().await;
        self.mark_disconnected();
        self.auto_reconnect.store(previous, Ordering::SeqCst);
        result
    }

    fn may_reconnect(&self) -> bool {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            return false;
        }
        match &*self.selected_device.borrow() {
            Some(device) => device.supports_bluetooth(),
            None => lock(&self.last_device).is_some(),
        }
    }

    async fn reconnect(&self) -> SdkResult<()> {
        let has_selection = self.selected_device.borrow().is_some();
        if has_selection && self.platform.discovery() == Discovery::Scan {
            return self.connect_to_selected().await;
        }
        let last = lock(&self.last_device).clone();
        match last {
            Some(device) => self.connect(Some(device)).await,
            None => Err(SdkError::NotConnected),
        }
    }

    async fn follow_selection(&self, selected: Option<DeviceInfo>) {
        let previous = self.selected_device.send_replace(selected.clone());
        let switched =
            previous.as_ref().map(|d| &d.device_id) != selected.as_ref().map(|d| &d.device_id);
        if switched && self.state() != ConnectionState::Disconnected {
            self.log("selected device changed, dropping the current link");
            if let Err(e) = self.disconnect().await {
                self.log(format!("disconnect failed: {e}"));
            }
        }

        let Some(device) = selected else { return };
        if !self.config.auto_connect || self.state() != ConnectionState::Disconnected {
            return;
        }
        if !device.supports_bluetooth() {
            self.log(format!(
                "{} does not support Bluetooth streaming, not connecting",
                device.device_nickname
            ));
            return;
        }
        self.log(format!("auto-connect: looking for {}", device.device_nickname));
        if let Err(e) = self.connect_to_selected().await {
            warn!("bluetooth: auto-connect failed: {e}");
            self.log(format!("auto-connect failed: {e}"));
        }
    }

    // ── Characteristic I/O ────────────────────────────────────────────────────

    async fn read(&self, name: &str) -> SdkResult<Vec<u8>> {
        let resolved = self.resolve(name)?;
        self.platform
            .read(&resolved.handle)
            .await
            .map_err(|e| SdkError::Read {
                characteristic: name.to_owned(),
                message: platform_message(e),
            })
    }

    async fn write(&self, name: &str, data: &[u8]) -> SdkResult<()> {
        let resolved = self.resolve(name)?;
        self.platform
            .write(&resolved.handle, data)
            .await
            .map_err(|e| SdkError::Write {
                characteristic: name.to_owned(),
                message: platform_message(e),
            })
    }

    async fn check_authenticated(&self) -> SdkResult<bool> {
        let bytes = self.read(characteristic::AUTH).await?;
        let authenticated: bool = serde_json::from_str(protocol::decode_text(&bytes).trim())?;
        self.set_authenticated(authenticated);
        Ok(authenticated)
    }

    /// Decoded packets of one characteristic.  The notification listener is
    /// attached before this returns.
    fn packet_stream(&self, resolved: &Resolved<P::Handle>, skip_json: bool) -> MetricStream<Packet> {
        let uuid = resolved.uuid;
        let values = broadcast_stream(self.platform.notifications())
            .filter(move |n| future::ready(n.uuid == uuid))
            .map(|n| n.value);

        if protocol::BINARY_CHARACTERISTICS.contains(&resolved.name) {
            return values.map(|v| Ok(Packet::Bytes(v))).boxed();
        }

        let packets = stitch(values, &self.config.chunk_delimiter).map(move |packet| {
            let packet = packet?;
            if skip_json {
                Ok(Packet::Text(packet))
            } else {
                serde_json::from_str(&packet)
                    .map(Packet::Json)
                    .map_err(SdkError::from)
            }
        });
        until_error(packets.boxed())
    }

    async fn subscribe(self: Arc<Self>, options: SubscribeOptions) -> SdkResult<MetricStream<Packet>> {
        let resolved = self.resolve(&options.name)?;
        let packets = self.packet_stream(&resolved, options.skip_json_decoding);
        if !options.manage_notifications {
            return Ok(packets);
        }

        self.platform
            .start_notifications(&resolved.handle)
            .await
            .map_err(|e| SdkError::Notify {
                characteristic: resolved.name.to_owned(),
                message: platform_message(e),
            })?;
        self.log(format!("{}: notifications started", resolved.name));

        let owner = Arc::downgrade(&self);
        let guard = OnDrop::new(move || {
            spawn_detached(async move {
                let Some(inner) = owner.upgrade() else { return };
                // A newer link starts with notifications off.
                if !inner.is_current(&resolved) {
                    return;
                }
                match inner.platform.stop_notifications(&resolved.handle).await {
                    Ok(()) => inner.log(format!("{}: notifications stopped", resolved.name)),
                    Err(e) => inner.log(format!("{}: stopping notifications failed: {e}", resolved.name)),
                }
            })
        });
        Ok(with_guard(packets, guard))
    }

    async fn sync_action_notifications(&self, wanted: bool, enabled_on: &mut Option<u64>) {
        let resolved = match self.resolve(characteristic::ACTIONS) {
            Ok(resolved) => resolved,
            Err(_) => {
                *enabled_on = None;
                set_flag(&self.actions_notifying, false);
                return;
            }
        };
        let live = *enabled_on == Some(resolved.generation);
        if wanted && !live {
            match self.platform.start_notifications(&resolved.handle).await {
                Ok(()) => {
                    *enabled_on = Some(resolved.generation);
                    set_flag(&self.actions_notifying, true);
                    self.log("actions: notifications started");
                }
                Err(e) => self.log(format!("actions: starting notifications failed: {e}")),
            }
        } else if !wanted && live {
            *enabled_on = None;
            set_flag(&self.actions_notifying, false);
            match self.platform.stop_notifications(&resolved.handle).await {
                Ok(()) => self.log("actions: notifications stopped"),
                Err(e) => self.log(format!("actions: stopping notifications failed: {e}")),
            }
        }
    }

    /// Channel count and epoch parameters for the selected device.
    fn epoch_layout(&self) -> (usize, EpochOptions) {
        let device = self.selected_device.borrow().clone();
        let mut options = match &device {
            Some(device) => EpochOptions::for_device(device),
            None => EpochOptions {
                sampling_rate: self.config.default_sampling_rate,
                ..EpochOptions::default()
            },
        };
        options.duration = self.config.epoch_duration;
        options.interval = self.config.epoch_interval;
        let channels = device
            .map(|d| if d.channels > 0 { d.channels } else { d.channel_names.len() })
            .filter(|c| *c > 0)
            .unwrap_or(self.config.default_channel_count);
        (channels, options)
    }
}

#[async_trait]
impl<P: BlePlatform> ActionChannel for Inner<P> {
    async fn write_action(&self, characteristic: &str, payload: Vec<u8>) -> SdkResult<()> {
        if self.correlator.pending_count() > 0 {
            let mut notifying = self.actions_notifying.subscribe();
            let confirmed = tokio::time::timeout(NOTIFY_SETTLE, notifying.wait_for(|on| *on))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);
            if !confirmed {
                self.log("actions: writing before response notifications were confirmed");
            }
        }
        self.write(characteristic, &payload).await
    }

    fn action_responses(&self, characteristic: &str) -> SdkResult<MetricStream<Value>> {
        let resolved = self.resolve(characteristic)?;
        Ok(self
            .packet_stream(&resolved, false)
            .try_filter_map(|packet| {
                future::ready(Ok(match packet {
                    Packet::Json(value) => Some(value),
                    _ => None,
                }))
            })
            .boxed())
    }
}

/// Per-subscription reassembly of binary frames.  A notification may end
/// mid-frame; only whole frames are decoded and the tail waits for the next
/// notification.
struct FrameBuffer {
    channels: usize,
    pending: Vec<u8>,
}

impl FrameBuffer {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, item: SdkResult<Packet>) -> Vec<SdkResult<Sample>> {
        let bytes = match item {
            Ok(Packet::Bytes(bytes)) => bytes,
            Ok(_) => {
                return vec![Err(SdkError::InvalidArgument(
                    "epochs need a binary characteristic".into(),
                ))]
            }
            Err(e) => return vec![Err(e)],
        };
        self.pending.extend_from_slice(&bytes);
        let whole = self.pending.len() - self.pending.len() % sample_size(self.channels);
        if whole == 0 {
            return Vec::new();
        }
        let frames: Vec<u8> = self.pending.drain(..whole).collect();
        match decode_samples(&frames, self.channels) {
            Ok(samples) => samples.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        }
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

/// Reacts to link loss: invalidate, mark DISCONNECTED, maybe reconnect once.
async fn watch_link<P: BlePlatform>(owner: Weak<Inner<P>>, mut events: broadcast::Receiver<()>) {
    loop {
        match events.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
        let Some(inner) = owner.upgrade() else { break };
        if inner.state() != ConnectionState::Connected {
            inner.log("link event while not connected, ignored");
            continue;
        }

        info!("bluetooth: device disconnected");
        inner.log("device disconnected");
        inner.mark_disconnected();

        if inner.may_reconnect() {
            inner.log("auto-reconnect: attempting");
            match inner.reconnect().await {
                Ok(()) => inner.log("auto-reconnect: connected"),
                Err(e) => {
                    warn!("bluetooth: auto-reconnect failed: {e}");
                    inner.log(format!("auto-reconnect failed: {e}"));
                }
            }
        }
    }
}

/// Keeps `actions` notifications on exactly while an action is pending.
async fn drive_action_notifications<P: BlePlatform>(
    owner: Weak<Inner<P>>,
    mut pending: watch::Receiver<BTreeSet<String>>,
    mut connection: watch::Receiver<ConnectionState>,
) {
    let mut enabled_on = None;
    loop {
        let wanted = !pending.borrow_and_update().is_empty();
        connection.borrow_and_update();
        let Some(inner) = owner.upgrade() else { break };
        inner.sync_action_notifications(wanted, &mut enabled_on).await;
        drop(inner);

        tokio::select! {
            changed = pending.changed() => if changed.is_err() { break },
            changed = connection.changed() => if changed.is_err() { break },
        }
    }
}

// ── BluetoothClient ───────────────────────────────────────────────────────────

/// BLE transport for one headset.
///
/// Cheap to clone; clones share the link.  All background work holds weak
/// references, so dropping the last clone stops it.
pub struct BluetoothClient<P: BlePlatform> {
    inner: Arc<Inner<P>>,
}

impl<P: BlePlatform> Clone for BluetoothClient<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: BlePlatform> BluetoothClient<P> {
    /// Create a transport on `platform`.
    ///
    /// Must be called inside a tokio runtime: the link watcher and the
    /// `actions` notification driver are spawned here.
    pub fn new(platform: P, config: BluetoothConfig) -> Self {
        let link_events = platform.disconnections();
        let correlator = ActionCorrelator::new();
        let pending = correlator.pending_actions();
        let inner = Arc::new(Inner {
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            platform,
            config,
            connection: watch::Sender::new(ConnectionState::Disconnected),
            authenticated: watch::Sender::new(false),
            ready: watch::Sender::new(false),
            handles: Mutex::new(HandleMap::new()),
            correlator,
            actions_notifying: watch::Sender::new(false),
            logs: broadcast::channel(LOG_CAPACITY).0,
            selected_device: watch::Sender::new(None),
            last_device: Mutex::new(None),
            json_metrics: Mutex::new(HashMap::new()),
            epoch_metrics: Mutex::new(HashMap::new()),
        });

        let connection = inner.connection.subscribe();
        tokio::spawn(watch_link(Arc::downgrade(&inner), link_events));
        tokio::spawn(drive_action_notifications(
            Arc::downgrade(&inner),
            pending,
            connection,
        ));
        Self { inner }
    }

    pub fn platform(&self) -> &P {
        &self.inner.platform
    }

    pub fn config(&self) -> &BluetoothConfig {
        &self.inner.config
    }

    /// Scan for the selected device by nickname and connect to it.
    pub async fn connect_to_selected(&self) -> SdkResult<()> {
        self.inner.connect_to_selected().await
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// `connected && (authenticated || !require_authentication)`, replayed.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready.subscribe()
    }

    fn gated_json(&self, name: &str) -> Multicast<Value> {
        let owner = Arc::downgrade(&self.inner);
        let ready = self.inner.ready.subscribe();
        let name = name.to_owned();
        Multicast::new(format!("ble:{name}"), move || {
            let (owner, name) = (owner.clone(), name.clone());
            switch_map(ready.clone(), move |ready: &bool| {
                if !*ready {
                    return None;
                }
                let (owner, name) = (owner.clone(), name.clone());
                let upstream = stream::once(async move {
                    let inner = owner.upgrade().ok_or(SdkError::NotConnected)?;
                    inner.subscribe(SubscribeOptions::managed(name)).await
                })
                .try_flatten()
                .map(|item| item.and_then(Packet::into_json));
                Some(upstream.boxed())
            })
        })
    }

    fn gated_epochs(&self, name: &str) -> Multicast<Epoch> {
        let owner = Arc::downgrade(&self.inner);
        let ready = self.inner.ready.subscribe();
        let name = name.to_owned();
        Multicast::new(format!("ble:{name}:epochs"), move || {
            let (owner, name) = (owner.clone(), name.clone());
            switch_map(ready.clone(), move |ready: &bool| {
                if !*ready {
                    return None;
                }
                let (owner, name) = (owner.clone(), name.clone());
                let upstream = stream::once(async move {
                    let inner = owner.upgrade().ok_or(SdkError::NotConnected)?;
                    let (channels, options) = inner.epoch_layout();
                    let packets = inner.subscribe(SubscribeOptions::managed(name)).await?;
                    let samples = packets
                        .scan(FrameBuffer::new(channels), |frames, item| {
                            future::ready(Some(stream::iter(frames.push(item))))
                        })
                        .flatten();
                    Ok::<_, SdkError>(epochs(samples, options).boxed())
                })
                .try_flatten();
                Some(upstream.boxed())
            })
        })
    }
}

#[async_trait]
impl<P: BlePlatform> BluetoothTransport for BluetoothClient<P> {
    fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    fn logs(&self) -> BoxStream<'static, String> {
        broadcast_stream(self.inner.logs.subscribe())
    }

    fn scan(&self, filter: Option<ScanFilter>) -> Option<MetricStream<Vec<DiscoveredDevice>>> {
        if self.inner.platform.discovery() != Discovery::Scan {
            return None;
        }
        let filter = filter.unwrap_or_else(|| self.inner.config.filter());
        let window = self.inner.config.scan_window;
        let state = (Arc::downgrade(&self.inner), filter, BTreeMap::<String, DiscoveredDevice>::new());
        let windows = stream::unfold(state, move |(owner, filter, mut seen)| async move {
            loop {
                let inner = owner.upgrade()?;
                let found = match inner.platform.scan_window(&filter, window).await {
                    Ok(found) => found,
                    Err(e) => return Some((Err(e), (owner, filter, seen))),
                };
                drop(inner);

                let mut changed = false;
                for device in found.into_iter().filter(|d| filter.matches(d)) {
                    changed |= seen.get(&device.id).map_or(true, |prev| prev.name != device.name);
                    seen.insert(device.id.clone(), device);
                }
                if changed {
                    let devices = seen.values().cloned().collect();
                    return Some((Ok(devices), (owner, filter, seen)));
                }
            }
        });
        Some(until_error(windows.boxed()))
    }

    async fn connect(&self, device: Option<DiscoveredDevice>) -> SdkResult<()> {
        self.inner.connect(device).await
    }

    async fn disconnect(&self) -> SdkResult<()> {
        self.inner.disconnect().await
    }

    async fn read_characteristic(&self, name: &str) -> SdkResult<Vec<u8>> {
        self.inner.read(name).await
    }

    async fn write_characteristic(&self, name: &str, data: &[u8]) -> SdkResult<()> {
        self.inner.write(name, data).await
    }

    async fn subscribe_to_characteristic(&self, options: SubscribeOptions) -> SdkResult<MetricStream<Packet>> {
        Arc::clone(&self.inner).subscribe(options).await
    }

    async fn dispatch_action(&self, action: Action) -> SdkResult<Value> {
        self.inner
            .correlator
            .dispatch(&*self.inner, characteristic::ACTIONS, action)
            .await
    }

    async fn authenticate(&self, token: &str) -> SdkResult<bool> {
        self.inner.write(characteristic::AUTH, token.as_bytes()).await?;
        self.inner.check_authenticated().await
    }

    async fn is_authenticated(&self) -> SdkResult<bool> {
        self.inner.check_authenticated().await
    }

    fn authenticated(&self) -> watch::Receiver<bool> {
        self.inner.authenticated.subscribe()
    }

    fn attach_device(&self, mut device: watch::Receiver<Option<DeviceInfo>>) {
        let owner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let selected = device.borrow_and_update().clone();
                let Some(inner) = owner.upgrade() else { break };
                inner.follow_selection(selected).await;
                drop(inner);
                if device.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    fn json_metric(&self, characteristic: &str) -> MetricStream<Value> {
        let multicast = lock(&self.inner.json_metrics)
            .entry(characteristic.to_owned())
            .or_insert_with(|| self.gated_json(characteristic))
            .clone();
        multicast.subscribe()
    }

    fn epochs(&self, characteristic: &str) -> MetricStream<Epoch> {
        let multicast = lock(&self.inner.epoch_metrics)
            .entry(characteristic.to_owned())
            .or_insert_with(|| self.gated_epochs(characteristic))
            .clone();
        multicast.subscribe()
    }

    fn pending_actions(&self) -> watch::Receiver<BTreeSet<String>> {
        self.inner.correlator.pending_actions()
    }
}
