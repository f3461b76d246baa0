//! Cloud transport capability and the metric-subscription bookkeeping built
//! on top of it.
//!
//! The backend itself (persistence, auth mechanics, HTTP) is opaque: an
//! implementation of [`CloudTransport`] provides login, a realtime namespace
//! feed per device, command dispatch and the device claim list.
//! [`CloudClient`] adds what every implementation shares: one
//! [`Subscription`] record per metric stream, registered with the backend on
//! subscribe and removed exactly once when the stream goes away or on a bulk
//! [`clear`](CloudClient::clear_subscriptions).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{SdkError, SdkResult};
use crate::stream::{spawn_detached, until_error, with_guard, MetricStream, OnDrop};
use crate::types::{Action, DeviceInfo, DeviceStatus};

/// Namespace of the live device status document.
pub const STATUS_NAMESPACE: &str = "status";
/// Namespace of the device settings document.
pub const SETTINGS_NAMESPACE: &str = "settings";

// ── Session types ─────────────────────────────────────────────────────────────

/// One of the supported sign-in methods.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    EmailPassword { email: String, password: String },
    CustomToken(String),
    /// An OAuth id token from an external identity provider.
    OAuth { id_token: String, provider: String },
    ApiKey(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Custom claims carried by the signed-in user's token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserClaims {
    /// OAuth / API-key scopes.  `None` for email/password sessions, which
    /// are unrestricted.
    pub scopes: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes
            .as_ref()
            .map_or(true, |scopes| scopes.iter().any(|s| s == scope))
    }
}

/// Parameters of `create_oauth_url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthUrlConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Parameters of `get_oauth_token`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthQuery {
    pub client_id: String,
    pub client_secret: String,
    pub user_id: String,
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

/// A metric subscription registered with the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub client_id: String,
    pub metric: String,
    pub labels: Vec<String>,
    /// `true`: one subscription carries all labels.
    pub atomic: bool,
    pub server_type: String,
}

impl Subscription {
    pub fn new(client_id: &str, server_type: &str, metric: &str, labels: Vec<String>, atomic: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_owned(),
            metric: metric.to_owned(),
            labels,
            atomic,
            server_type: server_type.to_owned(),
        }
    }

    /// Realtime namespace carrying this subscription's values.
    ///
    /// | atomic | path |
    /// |---|---|
    /// | `true` | `metrics/{metric}` |
    /// | `false` | `metrics/{metric}/{label}` |
    pub fn namespace(&self) -> String {
        match (self.atomic, self.labels.first()) {
            (false, Some(label)) => format!("metrics/{}/{}", self.metric, label),
            _ => format!("metrics/{}", self.metric),
        }
    }
}

/// Per-client registry of live subscriptions, keyed by id.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, subscription: Subscription) {
        self.lock().insert(subscription.id.clone(), subscription);
    }

    /// Remove one subscription.  `None` when it was already removed, which
    /// makes removal exactly-once across drop and bulk clear.
    pub fn remove(&self, id: &str) -> Option<Subscription> {
        self.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Subscription> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove everything and hand back what was removed.
    pub fn clear(&self) -> Vec<Subscription> {
        self.lock().drain().map(|(_, s)| s).collect()
    }
}

// ── CloudTransport ────────────────────────────────────────────────────────────

/// The backend capability consumed by the SDK.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn login(&self, credentials: Credentials) -> SdkResult<User>;

    async fn logout(&self) -> SdkResult<()>;

    async fn create_account(&self, email: &str, password: &str) -> SdkResult<User>;

    async fn delete_account(&self) -> SdkResult<()>;

    /// Replayed auth state; `None` while logged out.
    fn user(&self) -> watch::Receiver<Option<User>>;

    /// Replayed claims of the signed-in user.
    fn user_claims(&self) -> watch::Receiver<Option<UserClaims>>;

    /// Devices claimed by the signed-in account.
    async fn get_devices(&self) -> SdkResult<Vec<DeviceInfo>>;

    async fn get_info(&self, device_id: &str) -> SdkResult<DeviceInfo>;

    async fn add_device(&self, device_id: &str) -> SdkResult<()>;

    async fn remove_device(&self, device_id: &str) -> SdkResult<()>;

    async fn transfer_device(&self, device_id: &str, recipient_email: &str) -> SdkResult<()>;

    /// Realtime values of one namespace of a device.
    fn observe_namespace(&self, device_id: &str, namespace: &str) -> MetricStream<Value>;

    /// One-shot read of a namespace.
    async fn get_namespace(&self, device_id: &str, namespace: &str) -> SdkResult<Value>;

    /// Dispatch a command.  The backend correlates responses itself and
    /// resolves with the response payload, or with the action id when no
    /// response was requested.
    async fn dispatch_action(&self, device_id: &str, action: Action) -> SdkResult<Value>;

    async fn subscribe_metric(&self, device_id: &str, subscription: &Subscription) -> SdkResult<()>;

    async fn unsubscribe_metric(&self, device_id: &str, subscription: &Subscription) -> SdkResult<()>;

    /// Custom token that authenticates a BLE link to `device_id`.
    async fn create_bluetooth_token(&self, device_id: &str) -> SdkResult<String>;

    async fn create_oauth_url(&self, config: &OAuthUrlConfig) -> SdkResult<String>;

    async fn get_oauth_token(&self, query: &OAuthQuery) -> SdkResult<Value>;

    async fn remove_oauth_access(&self) -> SdkResult<()>;
}

// ── CloudClient ───────────────────────────────────────────────────────────────

/// [`CloudTransport`] plus subscription bookkeeping.  Cheap to clone.
#[derive(Clone)]
pub struct CloudClient {
    transport: Arc<dyn CloudTransport>,
    subscriptions: Arc<SubscriptionManager>,
    client_id: String,
    server_type: String,
}

impl CloudClient {
    pub fn new(transport: Arc<dyn CloudTransport>, client_id: impl Into<String>, server_type: impl Into<String>) -> Self {
        Self {
            transport,
            subscriptions: Arc::new(SubscriptionManager::new()),
            client_id: client_id.into(),
            server_type: server_type.into(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn CloudTransport> {
        &self.transport
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Stream a metric.  Atomic metrics use one subscription for all labels;
    /// non-atomic metrics get one subscription per label, merged.
    pub fn metric(&self, device_id: &str, metric: &str, labels: &[&str], atomic: bool) -> MetricStream<Value> {
        let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let subscriptions = if atomic || labels.len() <= 1 {
            vec![Subscription::new(&self.client_id, &self.server_type, metric, labels, atomic)]
        } else {
            labels
                .into_iter()
                .map(|label| Subscription::new(&self.client_id, &self.server_type, metric, vec![label], false))
                .collect()
        };
        let streams: Vec<_> = subscriptions
            .into_iter()
            .map(|s| self.subscription_stream(device_id, s))
            .collect();
        until_error(stream::select_all(streams).boxed())
    }

    fn subscription_stream(&self, device_id: &str, subscription: Subscription) -> MetricStream<Value> {
        let transport = Arc::clone(&self.transport);
        let manager = Arc::clone(&self.subscriptions);
        let device_id = device_id.to_owned();

        stream::once(async move {
            transport.subscribe_metric(&device_id, &subscription).await?;
            manager.add(subscription.clone());
            debug!("cloud: subscribed {} ({})", subscription.namespace(), subscription.id);

            let values = transport.observe_namespace(&device_id, &subscription.namespace());
            let guard = OnDrop::new(move || {
                if manager.remove(&subscription.id).is_none() {
                    return;
                }
                spawn_detached(async move {
                    match transport.unsubscribe_metric(&device_id, &subscription).await {
                        Ok(()) => debug!("cloud: unsubscribed {}", subscription.id),
                        Err(e) => warn!("cloud: unsubscribe {} failed: {e}", subscription.id),
                    }
                });
            });
            Ok::<_, SdkError>(with_guard(values, guard))
        })
        .try_flatten()
        .boxed()
    }

    /// Bulk-remove every live subscription (logout, device change).
    pub async fn clear_subscriptions(&self, device_id: Option<&str>) {
        let removed = self.subscriptions.clear();
        if removed.is_empty() {
            return;
        }
        debug!("cloud: clearing {} subscription(s)", removed.len());
        let Some(device_id) = device_id else { return };
        for subscription in removed {
            if let Err(e) = self.transport.unsubscribe_metric(device_id, &subscription).await {
                warn!("cloud: unsubscribe {} failed: {e}", subscription.id);
            }
        }
    }

    /// Typed live status of a device.
    pub fn status(&self, device_id: &str) -> MetricStream<DeviceStatus> {
        self.transport
            .observe_namespace(device_id, STATUS_NAMESPACE)
            .and_then(|value| future::ready(decode_status(value)))
            .boxed()
    }

    /// Cloud connectivity of a device: online unless its status state is
    /// `offline` or missing.  Distinct.
    pub fn online(&self, device_id: &str) -> MetricStream<bool> {
        self.status(device_id)
            .map_ok(|status| status.is_online())
            .scan(None, |last, item| {
                let out = match item {
                    Ok(online) if *last == Some(online) => None,
                    Ok(online) => {
                        *last = Some(online);
                        Some(Ok(online))
                    }
                    Err(e) => Some(Err(e)),
                };
                future::ready(Some(out))
            })
            .filter_map(future::ready)
            .boxed()
    }
}

fn decode_status(value: Value) -> SdkResult<DeviceStatus> {
    if value.is_null() {
        return Ok(DeviceStatus::default());
    }
    Ok(serde_json::from_value(value)?)
}
