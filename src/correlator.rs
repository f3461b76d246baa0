//! Request/response correlation over a shared notification channel.
//!
//! Commands that expect an answer are tagged with a fresh `actionId`, tracked
//! as pending, and resolved by the first notification echoing that id.  The
//! pending set is published on a `watch` channel so the owning transport can
//! keep response notifications enabled exactly while something is pending.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{SdkError, SdkResult};
use crate::protocol::{encode_action, DEFAULT_RESPONSE_TIMEOUT};
use crate::stream::{MetricStream, OnDrop};
use crate::types::Action;

/// The two primitives the correlator needs from a transport.
#[async_trait]
pub trait ActionChannel: Send + Sync {
    /// Write an encoded action to `characteristic`.
    async fn write_action(&self, characteristic: &str, payload: Vec<u8>) -> SdkResult<()>;

    /// Decoded JSON packets arriving on `characteristic`.  Must not toggle
    /// notifications; the listener has to be attached when this returns.
    fn action_responses(&self, characteristic: &str) -> SdkResult<MetricStream<Value>>;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Strictly increasing, timestamp-seeded action ids.
///
/// Ids are the current time in milliseconds, bumped past the previous id when
/// two actions are created within the same millisecond, so no two ids from
/// one generator ever collide.
#[derive(Debug, Default)]
pub struct ActionIdGenerator {
    last: AtomicU64,
}

impl ActionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let now = now_ms();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next.to_string(),
                Err(actual) => prev = actual,
            }
        }
    }
}

fn response_id(value: &Value) -> Option<String> {
    match value.get("actionId")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Owns the pending-action set of one transport instance.
#[derive(Debug)]
pub struct ActionCorrelator {
    ids: ActionIdGenerator,
    pending: watch::Sender<BTreeSet<String>>,
}

impl Default for ActionCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionCorrelator {
    pub fn new() -> Self {
        Self {
            ids: ActionIdGenerator::new(),
            pending: watch::Sender::new(BTreeSet::new()),
        }
    }

    /// Replayed view of the pending set.
    pub fn pending_actions(&self) -> watch::Receiver<BTreeSet<String>> {
        self.pending.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    fn register(&self, id: &str) {
        self.pending.send_modify(|set| {
            set.insert(id.to_owned());
        });
    }

    fn release(pending: &watch::Sender<BTreeSet<String>>, id: &str) {
        pending.send_if_modified(|set| set.remove(id));
    }

    /// Dispatch `action` on `characteristic`.
    ///
    /// Without `response_required` this resolves to `Value::Null` as soon as
    /// the write succeeds.  Otherwise the first of {matching response,
    /// timeout} wins; the pending entry is released exactly once on every
    /// path, including write failure and the caller dropping the future.
    pub async fn dispatch<C>(&self, channel: &C, characteristic: &str, mut action: Action) -> SdkResult<Value>
    where
        C: ActionChannel + ?Sized,
    {
        if !action.response_required {
            action.action_id.get_or_insert_with(|| self.ids.next_id());
            let payload = encode_action(&action)?;
            channel.write_action(characteristic, payload).await?;
            return Ok(Value::Null);
        }

        let id = self.ids.next_id();
        action.action_id = Some(id.clone());
        let timeout = action
            .response_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        let payload = encode_action(&action)?;

        self.register(&id);
        let pending = self.pending.clone();
        let release_id = id.clone();
        let _release = OnDrop::new(move || Self::release(&pending, &release_id));

        // Listen before writing so a fast response cannot slip past.
        let mut responses = channel.action_responses(characteristic)?;
        debug!("action {id}: {}.{} pending ({} ms)", action.command, action.action, timeout.as_millis());

        let exchange = async {
            channel.write_action(characteristic, payload).await?;
            while let Some(item) = responses.next().await {
                let value = item?;
                if response_id(&value).as_deref() == Some(id.as_str()) {
                    return Ok(value);
                }
            }
            Err(SdkError::StreamClosed)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(value)) => {
                debug!("action {id}: response received");
                Ok(value.get("response").cloned().unwrap_or(value))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SdkError::Timeout {
                action_id: id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::broadcast_stream;
    use futures::stream::StreamExt as _;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    /// Loopback channel: writes are recorded, responses are injected.
    struct Loopback {
        writes: Mutex<Vec<Value>>,
        responses: broadcast::Sender<Value>,
        fail_writes: bool,
    }

    impl Loopback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                responses: broadcast::channel(16).0,
                fail_writes: false,
            })
        }

        fn last_action_id(&self) -> String {
            let writes = self.writes.lock().unwrap();
            writes.last().unwrap()["actionId"].as_str().unwrap().to_owned()
        }
    }

    #[async_trait]
    impl ActionChannel for Loopback {
        async fn write_action(&self, characteristic: &str, payload: Vec<u8>) -> SdkResult<()> {
            if self.fail_writes {
                return Err(SdkError::Write {
                    characteristic: characteristic.into(),
                    message: "GATT error".into(),
                });
            }
            self.writes
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&payload).unwrap());
            Ok(())
        }

        fn action_responses(&self, _characteristic: &str) -> SdkResult<MetricStream<Value>> {
            Ok(broadcast_stream(self.responses.subscribe()).map(Ok).boxed())
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let g = ActionIdGenerator::new();
        let ids: Vec<u64> = (0..1000).map(|_| g.next_id().parse().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn fire_and_forget_resolves_on_write() {
        let ch = Loopback::new();
        let c = ActionCorrelator::new();
        let out = c
            .dispatch(&*ch, "actions", Action::new("marker", "add"))
            .await
            .unwrap();
        assert_eq!(out, Value::Null);
        assert_eq!(c.pending_count(), 0);
        assert_eq!(ch.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn matching_response_resolves_and_releases() {
        let ch = Loopback::new();
        let c = Arc::new(ActionCorrelator::new());
        let mut pending = c.pending_actions();

        let task = {
            let (ch, c) = (Arc::clone(&ch), Arc::clone(&c));
            tokio::spawn(async move {
                let action = Action::new("haptics", "queue").with_response(Duration::from_secs(5));
                c.dispatch(&*ch, "actions", action).await
            })
        };

        pending.wait_for(|set| !set.is_empty()).await.unwrap();
        while ch.writes.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        let id = ch.last_action_id();

        // Unrelated and out-of-order responses are ignored.
        ch.responses.send(json!({"actionId": "other", "response": 0})).unwrap();
        ch.responses.send(json!({"actionId": id, "response": {"queued": true}})).unwrap();

        let out = task.await.unwrap().unwrap();
        assert_eq!(out, json!({"queued": true}));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_releases() {
        let ch = Loopback::new();
        let c = ActionCorrelator::new();
        let action = Action::new("wifi", "reset").with_response(Duration::from_millis(250));
        let err = c.dispatch(&*ch, "actions", action).await.unwrap_err();
        match err {
            SdkError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 250),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn write_failure_releases_pending() {
        let ch = Arc::new(Loopback {
            writes: Mutex::new(Vec::new()),
            responses: broadcast::channel(4).0,
            fail_writes: true,
        });
        let c = ActionCorrelator::new();
        let mut pending = c.pending_actions();
        let action = Action::new("haptics", "queue").with_response(Duration::from_secs(1));
        let err = c.dispatch(&*ch, "actions", action).await.unwrap_err();
        assert!(matches!(err, SdkError::Write { .. }));
        assert_eq!(c.pending_count(), 0);
        // One insert and one removal were published.
        assert!(pending.has_changed().unwrap());
        assert!(pending.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn cancelled_dispatch_releases_pending() {
        let ch = Loopback::new();
        let c = ActionCorrelator::new();
        let action = Action::new("haptics", "queue").with_response(Duration::from_secs(30));
        {
            let fut = c.dispatch(&*ch, "actions", action);
            tokio::pin!(fut);
            let _ = futures::poll!(fut.as_mut());
            assert_eq!(c.pending_count(), 1);
        }
        assert_eq!(c.pending_count(), 0);
    }
}
