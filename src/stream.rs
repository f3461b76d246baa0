//! Stream plumbing shared by both transports.
//!
//! * [`Multicast`] — one upstream subscription fanned out to many
//!   subscribers, started by the first and stopped by the last.
//! * [`switch_map`] — follow a `watch` value and re-subscribe whenever it
//!   changes, dropping the previous inner stream first.
//! * [`OnDrop`] — run a teardown closure exactly once.

use std::sync::{Arc, Mutex};

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::error::{SdkError, SdkResult};

/// Stream type returned by every subscribe-style operation.
pub type MetricStream<T> = BoxStream<'static, SdkResult<T>>;

/// Capacity of every multicast channel.  A subscriber that falls further
/// behind than this skips the oldest values.
const MULTICAST_CAPACITY: usize = 256;

// ── OnDrop ───────────────────────────────────────────────────────────────────

/// Runs the wrapped closure when dropped.  Attach one to a stream's state to
/// release resources when the subscriber goes away, whatever the reason.
pub struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Spawn `fut` on the current runtime if there is one.  Used by drop guards,
/// which cannot await.
pub fn spawn_detached<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => debug!("no tokio runtime available, skipping teardown task"),
    }
}

// ── Small constructors ───────────────────────────────────────────────────────

/// A stream that yields one error and ends.
pub fn error_stream<T: Send + 'static>(err: SdkError) -> MetricStream<T> {
    stream::once(async move { Err(err) }).boxed()
}

/// Receive every value from a broadcast channel.  Lagging receivers skip
/// ahead with a warning; the stream ends when all senders are gone.
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(rx)
        .filter_map(|item| {
            future::ready(match item {
                Ok(v) => Some(v),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("subscriber lagged, skipped {n} value(s)");
                    None
                }
            })
        })
        .boxed()
}

/// Current value of a `watch` channel followed by every change.
pub fn watch_stream<T>(rx: watch::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + Sync + 'static,
{
    WatchStream::new(rx).boxed()
}

/// Keep `guard` alive exactly as long as the stream.
pub fn with_guard<T, G>(s: MetricStream<T>, guard: G) -> MetricStream<T>
where
    T: Send + 'static,
    G: Send + 'static,
{
    stream::unfold((s, guard), |(mut s, guard)| async move {
        let item = s.next().await?;
        Some((item, (s, guard)))
    })
    .boxed()
}

/// Stop after the first error, forwarding it.
pub fn until_error<T: Send + 'static>(s: MetricStream<T>) -> MetricStream<T> {
    stream::unfold((s, false), |(mut s, failed)| async move {
        if failed {
            return None;
        }
        let item = s.next().await?;
        let failed = item.is_err();
        Some((item, (s, failed)))
    })
    .boxed()
}

// ── switch_map ───────────────────────────────────────────────────────────────

async fn next_inner<T>(inner: &mut Option<MetricStream<T>>) -> Option<SdkResult<T>> {
    match inner {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

/// Follow `input` and forward items from `project(current value)`.
///
/// Whenever `input` changes the current inner stream is dropped before the
/// projection runs again, so there is never more than one live upstream
/// subscription.  `project` returning `None` means "nothing to stream right
/// now": the output idles until the next change.
///
/// An inner stream ending is not an error; the output waits for the next
/// change.  An inner error is forwarded and ends the output.  The output
/// ends when the `watch` sender is dropped and no inner stream is active.
pub fn switch_map<S, T, F>(input: watch::Receiver<S>, project: F) -> MetricStream<T>
where
    S: Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: FnMut(&S) -> Option<MetricStream<T>> + Send + 'static,
{
    struct State<S, T, F> {
        input: watch::Receiver<S>,
        project: F,
        inner: Option<MetricStream<T>>,
        started: bool,
        input_open: bool,
        done: bool,
    }

    let state = State {
        input,
        project,
        inner: None,
        started: false,
        input_open: true,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        if !st.started {
            st.started = true;
            let value = st.input.borrow_and_update().clone();
            st.inner = (st.project)(&value);
        }
        loop {
            if !st.input_open && st.inner.is_none() {
                return None;
            }
            tokio::select! {
                changed = st.input.changed(), if st.input_open => {
                    if changed.is_err() {
                        st.input_open = false;
                        continue;
                    }
                    // Tear down before re-projecting.
                    st.inner = None;
                    let value = st.input.borrow_and_update().clone();
                    st.inner = (st.project)(&value);
                }
                item = next_inner(&mut st.inner) => match item {
                    Some(Ok(v)) => return Some((Ok(v), st)),
                    Some(Err(e)) => {
                        st.done = true;
                        st.inner = None;
                        return Some((Err(e), st));
                    }
                    None => st.inner = None,
                },
            }
        }
    })
    .boxed()
}

// ── Multicast ────────────────────────────────────────────────────────────────

type Factory<T> = dyn Fn() -> MetricStream<T> + Send + Sync;

struct Shared<T> {
    tx: Option<broadcast::Sender<SdkResult<T>>>,
    pump: Option<JoinHandle<()>>,
    subscribers: usize,
    /// Bumped per upstream so a finished pump only clears its own channel.
    generation: u64,
}

/// Ref-counted fan-out of one upstream stream.
///
/// The first [`subscribe`](Multicast::subscribe) builds the upstream with the
/// factory and starts pumping it; the last subscriber to drop aborts the
/// pump, which drops the upstream and runs its teardown.  A later subscriber
/// starts a fresh upstream.
pub struct Multicast<T> {
    name: String,
    factory: Arc<Factory<T>>,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            factory: Arc::clone(&self.factory),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Multicast<T>
where
    T: Clone + Send + 'static,
{
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> MetricStream<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            shared: Arc::new(Mutex::new(Shared {
                tx: None,
                pump: None,
                subscribers: 0,
                generation: 0,
            })),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().map(|s| s.subscribers).unwrap_or(0)
    }

    pub fn subscribe(&self) -> MetricStream<T> {
        let rx = {
            let mut shared = match self.shared.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let rx = match &shared.tx {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(MULTICAST_CAPACITY);
                    let upstream = (self.factory)();
                    let pump_tx = tx.clone();
                    let name = self.name.clone();
                    shared.generation = shared.generation.wrapping_add(1);
                    let generation = shared.generation;
                    let owner = Arc::downgrade(&self.shared);
                    debug!("multicast {name}: starting upstream");
                    shared.pump = Some(tokio::spawn(async move {
                        let mut upstream = upstream;
                        while let Some(item) = upstream.next().await {
                            let failed = item.is_err();
                            // No receivers only happens between the last drop
                            // and the abort in the subscriber guard.
                            if pump_tx.send(item).is_err() || failed {
                                break;
                            }
                        }
                        debug!("multicast {name}: upstream finished");
                        // Close the channel so subscribers see the end.
                        drop(pump_tx);
                        if let Some(owner) = owner.upgrade() {
                            if let Ok(mut shared) = owner.lock() {
                                if shared.generation == generation {
                                    shared.tx = None;
                                    shared.pump = None;
                                }
                            }
                        }
                    }));
                    shared.tx = Some(tx);
                    rx
                }
            };
            shared.subscribers += 1;
            rx
        };

        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        let guard = OnDrop::new(move || {
            let mut shared = match shared.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            shared.subscribers = shared.subscribers.saturating_sub(1);
            if shared.subscribers == 0 {
                debug!("multicast {name}: last subscriber left, stopping upstream");
                shared.tx = None;
                if let Some(pump) = shared.pump.take() {
                    pump.abort();
                }
            }
        });

        until_error(with_guard(broadcast_stream(rx), guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Upstream that counts how many times it was built and torn down.
    fn counting_upstream(
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        tx: broadcast::Sender<u32>,
    ) -> impl Fn() -> MetricStream<u32> + Send + Sync + 'static {
        move || {
            starts.fetch_add(1, Ordering::SeqCst);
            let stops = Arc::clone(&stops);
            let guard = OnDrop::new(move || {
                stops.fetch_add(1, Ordering::SeqCst);
            });
            let rx = broadcast_stream(tx.subscribe());
            stream::unfold((rx, guard), |(mut rx, guard)| async move {
                let v = rx.next().await?;
                Some((Ok(v), (rx, guard)))
            })
            .boxed()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn multicast_starts_once_and_stops_after_last_subscriber() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let (tx, _) = broadcast::channel(16);
        let m = Multicast::new(
            "test",
            counting_upstream(Arc::clone(&starts), Arc::clone(&stops), tx.clone()),
        );

        let mut a = m.subscribe();
        let mut b = m.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(m.subscriber_count(), 2);
        settle().await;

        tx.send(7).unwrap();
        assert_eq!(a.next().await.unwrap().unwrap(), 7);
        assert_eq!(b.next().await.unwrap().unwrap(), 7);

        drop(a);
        settle().await;
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        drop(b);
        settle().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(m.subscriber_count(), 0);

        let _c = m.subscribe();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn multicast_forwards_error_and_ends() {
        let m: Multicast<u32> = Multicast::new("err", || {
            stream::iter(vec![Ok(1), Err(SdkError::StreamClosed), Ok(2)]).boxed()
        });
        let out: Vec<SdkResult<u32>> = m.subscribe().collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], Err(SdkError::StreamClosed));
    }

    #[tokio::test]
    async fn switch_map_tears_down_before_resubscribing() {
        let (mode_tx, mode_rx) = watch::channel(0u32);
        let live = Arc::new(AtomicUsize::new(0));
        let max_live = Arc::new(AtomicUsize::new(0));

        let (live_p, max_p) = (Arc::clone(&live), Arc::clone(&max_live));
        let mut out = switch_map(mode_rx, move |mode: &u32| {
            let n = live_p.fetch_add(1, Ordering::SeqCst) + 1;
            max_p.fetch_max(n, Ordering::SeqCst);
            let live = Arc::clone(&live_p);
            let guard = OnDrop::new(move || {
                live.fetch_sub(1, Ordering::SeqCst);
            });
            let mode = *mode;
            Some(
                stream::unfold((0u32, guard), move |(i, guard)| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Some((Ok(mode * 100 + i), (i + 1, guard)))
                })
                .boxed(),
            )
        });

        assert_eq!(out.next().await.unwrap().unwrap(), 0);
        mode_tx.send(1).unwrap();
        // Drain until values come from the new projection.
        loop {
            let v = out.next().await.unwrap().unwrap();
            if v >= 100 {
                break;
            }
        }
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(max_live.load(Ordering::SeqCst), 1);

        drop(out);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn switch_map_idles_on_none_and_ends_with_sender() {
        let (tx, rx) = watch::channel(false);
        let mut out = switch_map(rx, |on: &bool| {
            on.then(|| stream::iter(vec![Ok(1u8)]).boxed())
        });
        tx.send(true).unwrap();
        assert_eq!(out.next().await.unwrap().unwrap(), 1);
        drop(tx);
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_stream_skips_lagged_values_and_ends_with_sender() {
        let (tx, rx) = broadcast::channel(2);
        for i in 0..5u32 {
            tx.send(i).unwrap();
        }
        drop(tx);
        let out: Vec<u32> = broadcast_stream(rx).collect().await;
        assert_eq!(out, vec![3, 4]);
    }

    #[tokio::test]
    async fn watch_stream_replays_latest() {
        let (tx, rx) = watch::channel(1);
        tx.send(2).unwrap();
        let mut s = watch_stream(rx);
        assert_eq!(s.next().await, Some(2));
        tx.send(3).unwrap();
        assert_eq!(s.next().await, Some(3));
    }
}
