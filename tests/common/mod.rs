//! Shared fixtures: an in-memory cloud backend and device builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;

use neurosity_rs::cloud::{CloudTransport, Credentials, OAuthQuery, OAuthUrlConfig, Subscription, User, UserClaims};
use neurosity_rs::error::{SdkError, SdkResult};
use neurosity_rs::stream::{watch_stream, MetricStream};
use neurosity_rs::types::{Action, DeviceInfo};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// A BLE-capable model 3 headset on OS 16 with 8 channels at 256 Hz.
pub fn crown(id: &str, nickname: &str) -> DeviceInfo {
    DeviceInfo {
        device_id: id.into(),
        device_nickname: nickname.into(),
        channels: 8,
        channel_names: ["CP3", "C3", "F5", "PO3", "PO4", "F6", "C4", "CP4"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        sampling_rate: Some(256.0),
        model_name: "Crown".into(),
        model_version: "3".into(),
        os_version: "16.1.0".into(),
        ..Default::default()
    }
}

/// An older model without haptics or Bluetooth streaming.
pub fn notion(id: &str, model_version: &str) -> DeviceInfo {
    DeviceInfo {
        device_id: id.into(),
        device_nickname: format!("Notion-{id}"),
        channels: 8,
        model_name: "Notion".into(),
        model_version: model_version.into(),
        os_version: "15.2.0".into(),
        ..crown(id, "")
    }
}

/// Let spawned tasks run.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `cond` until it holds, advancing time in small steps.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// In-memory [`CloudTransport`].  Namespaces replay their latest value, and
/// every trait call except the `user` / `user_claims` getters is counted.
pub struct MemoryCloud {
    user: watch::Sender<Option<User>>,
    claims: watch::Sender<Option<UserClaims>>,
    login_claims: Mutex<Option<UserClaims>>,
    devices: Mutex<Vec<DeviceInfo>>,
    namespaces: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
    dispatched: Mutex<Vec<(String, Action)>>,
    subscribed: Mutex<Vec<Subscription>>,
    unsubscribed: Mutex<Vec<Subscription>>,
    calls: AtomicUsize,
}

impl MemoryCloud {
    pub fn new(devices: Vec<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self {
            user: watch::Sender::new(None),
            claims: watch::Sender::new(None),
            login_claims: Mutex::new(None),
            devices: Mutex::new(devices),
            namespaces: Mutex::new(HashMap::new()),
            dispatched: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Scopes carried by the next login, as an OAuth / API-key session.
    pub fn grant_on_login(&self, scopes: &[&str]) {
        *lock(&self.login_claims) = Some(UserClaims {
            scopes: Some(scopes.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn key(device_id: &str, namespace: &str) -> String {
        format!("{device_id}/{namespace}")
    }

    pub fn publish(&self, device_id: &str, namespace: &str, value: Value) {
        lock(&self.namespaces)
            .entry(Self::key(device_id, namespace))
            .or_insert_with(|| watch::Sender::new(None))
            .send_replace(Some(value));
    }

    pub fn set_online(&self, device_id: &str, online: bool) {
        let state = if online { "online" } else { "offline" };
        self.publish(device_id, "status", json!({ "state": state, "battery": 90 }));
    }

    pub fn dispatched(&self) -> Vec<(String, Action)> {
        lock(&self.dispatched).clone()
    }

    pub fn subscribed(&self) -> Vec<Subscription> {
        lock(&self.subscribed).clone()
    }

    pub fn unsubscribed(&self) -> Vec<Subscription> {
        lock(&self.unsubscribed).clone()
    }

    /// Subscriptions registered and not yet removed.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.subscribed).len() - lock(&self.unsubscribed).len()
    }

    fn require_user(&self, function: &str) -> SdkResult<()> {
        if self.user.borrow().is_some() {
            Ok(())
        } else {
            Err(SdkError::NotLoggedIn(function.into()))
        }
    }
}

#[async_trait]
impl CloudTransport for MemoryCloud {
    async fn login(&self, credentials: Credentials) -> SdkResult<User> {
        self.count();
        let email = match &credentials {
            Credentials::EmailPassword { email, .. } => Some(email.clone()),
            _ => None,
        };
        let user = User {
            uid: "user-1".into(),
            email,
            display_name: None,
        };
        let claims = lock(&self.login_claims).clone();
        self.claims.send_replace(claims);
        self.user.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn logout(&self) -> SdkResult<()> {
        self.count();
        self.user.send_replace(None);
        self.claims.send_replace(None);
        Ok(())
    }

    async fn create_account(&self, email: &str, _password: &str) -> SdkResult<User> {
        self.count();
        Ok(User {
            uid: "user-2".into(),
            email: Some(email.into()),
            display_name: None,
        })
    }

    async fn delete_account(&self) -> SdkResult<()> {
        self.count();
        self.user.send_replace(None);
        Ok(())
    }

    fn user(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    fn user_claims(&self) -> watch::Receiver<Option<UserClaims>> {
        self.claims.subscribe()
    }

    async fn get_devices(&self) -> SdkResult<Vec<DeviceInfo>> {
        self.count();
        self.require_user("get_devices")?;
        Ok(lock(&self.devices).clone())
    }

    async fn get_info(&self, device_id: &str) -> SdkResult<DeviceInfo> {
        self.count();
        lock(&self.devices)
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
            .ok_or_else(|| SdkError::DeviceNotFound(device_id.into()))
    }

    async fn add_device(&self, device_id: &str) -> SdkResult<()> {
        self.count();
        lock(&self.devices).push(crown(device_id, &format!("Crown-{device_id}")));
        Ok(())
    }

    async fn remove_device(&self, device_id: &str) -> SdkResult<()> {
        self.count();
        lock(&self.devices).retain(|d| d.device_id != device_id);
        Ok(())
    }

    async fn transfer_device(&self, device_id: &str, _recipient_email: &str) -> SdkResult<()> {
        self.remove_device(device_id).await
    }

    fn observe_namespace(&self, device_id: &str, namespace: &str) -> MetricStream<Value> {
        self.count();
        let rx = lock(&self.namespaces)
            .entry(Self::key(device_id, namespace))
            .or_insert_with(|| watch::Sender::new(None))
            .subscribe();
        watch_stream(rx)
            .filter_map(|value| future::ready(value.map(Ok)))
            .boxed()
    }

    async fn get_namespace(&self, device_id: &str, namespace: &str) -> SdkResult<Value> {
        self.count();
        let value = lock(&self.namespaces)
            .get(&Self::key(device_id, namespace))
            .and_then(|tx| tx.borrow().clone());
        Ok(value.unwrap_or(Value::Null))
    }

    async fn dispatch_action(&self, device_id: &str, action: Action) -> SdkResult<Value> {
        self.count();
        let response_required = action.response_required;
        lock(&self.dispatched).push((device_id.into(), action));
        if response_required {
            Ok(json!({ "ok": true }))
        } else {
            Ok(Value::Null)
        }
    }

    async fn subscribe_metric(&self, _device_id: &str, subscription: &Subscription) -> SdkResult<()> {
        self.count();
        lock(&self.subscribed).push(subscription.clone());
        Ok(())
    }

    async fn unsubscribe_metric(&self, _device_id: &str, subscription: &Subscription) -> SdkResult<()> {
        self.count();
        lock(&self.unsubscribed).push(subscription.clone());
        Ok(())
    }

    async fn create_bluetooth_token(&self, device_id: &str) -> SdkResult<String> {
        self.count();
        self.require_user("create_bluetooth_token")?;
        Ok(format!("token-for-{device_id}"))
    }

    async fn create_oauth_url(&self, config: &OAuthUrlConfig) -> SdkResult<String> {
        self.count();
        Ok(format!(
            "https://auth.example.com/authorize?client_id={}&scope={}",
            config.client_id,
            config.scope.join(",")
        ))
    }

    async fn get_oauth_token(&self, query: &OAuthQuery) -> SdkResult<Value> {
        self.count();
        Ok(json!({ "access_token": format!("{}-{}", query.client_id, query.user_id) }))
    }

    async fn remove_oauth_access(&self) -> SdkResult<()> {
        self.count();
        Ok(())
    }
}
