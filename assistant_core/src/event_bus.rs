//! In-process publish/subscribe hub.
//!
//! Each subscription owns a bounded queue drained by its own task, which
//! gives per-subscriber FIFO delivery and means `publish` never waits on a
//! subscriber: a full queue is a failed delivery for that subscriber only.
//! Deliveries run under a timeout; a subscriber that fails too many times in
//! a row is unsubscribed and the [`DeliveryObserver`] is told about it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::EventBusError;
use crate::settings::EventsConfig;

/// Well-known topics published by the orchestrator.
pub mod topics {
    pub const REQUEST_RECEIVED: &str = "request.received";
    pub const INTENT_RESOLVED: &str = "intent.resolved";
    pub const DISPATCH_COMPLETED: &str = "dispatch.completed";
    pub const DISPATCH_FAILED: &str = "dispatch.failed";
    pub const PLUGIN_REGISTERED: &str = "plugin.registered";
    pub const PLUGIN_DEREGISTERED: &str = "plugin.deregistered";
    pub const CONTEXT_UPDATED: &str = "context.updated";
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub source: String,
    pub published_at: DateTime<Utc>,
}

/// A subscriber callback. Errors and panics are contained per subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<EventRecord>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<EventRecord>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<EventRecord>) -> anyhow::Result<()> {
        (self)(event).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    Error(String),
    Panicked,
    TimedOut(Duration),
    QueueFull,
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailure::Error(e) => write!(f, "handler error: {e}"),
            DeliveryFailure::Panicked => f.write_str("handler panicked"),
            DeliveryFailure::TimedOut(d) => write!(f, "handler exceeded {}ms", d.as_millis()),
            DeliveryFailure::QueueFull => f.write_str("subscriber queue full"),
        }
    }
}

/// Observability collaborator for delivery failures. Never called on the
/// publisher's behalf with an error; publishers only learn how many
/// subscribers an event was queued for.
pub trait DeliveryObserver: Send + Sync {
    fn delivery_failed(&self, topic: &str, subscriber_id: &str, failure: &DeliveryFailure);
    fn subscriber_tripped(&self, topic: &str, subscriber_id: &str, consecutive_failures: u32);
}

/// Logs failures through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn delivery_failed(&self, topic: &str, subscriber_id: &str, failure: &DeliveryFailure) {
        warn!(topic, subscriber_id, "Event delivery failed: {}", failure);
    }

    fn subscriber_tripped(&self, topic: &str, subscriber_id: &str, consecutive_failures: u32) {
        warn!(
            topic,
            subscriber_id,
            consecutive_failures,
            "Subscriber auto-unsubscribed after repeated failures"
        );
    }
}

#[derive(Debug)]
struct SubscriberState {
    active: AtomicBool,
    consecutive_failures: AtomicU32,
}

struct Subscriber {
    id: String,
    tx: mpsc::Sender<Arc<EventRecord>>,
    state: Arc<SubscriberState>,
}

struct BusInner {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    observer: Arc<dyn DeliveryObserver>,
    queue_capacity: usize,
    delivery_timeout: Duration,
    failure_threshold: u32,
    closed: AtomicBool,
}

impl BusInner {
    /// Record one failed delivery; returns true once the breaker trips.
    fn record_failure(
        &self,
        topic: &str,
        subscriber_id: &str,
        state: &Arc<SubscriberState>,
        failure: DeliveryFailure,
    ) -> bool {
        self.observer.delivery_failed(topic, subscriber_id, &failure);
        let failures = state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.failure_threshold {
            return false;
        }
        if state.active.swap(false, Ordering::AcqRel) {
            self.remove_subscriber(topic, state);
            self.observer.subscriber_tripped(topic, subscriber_id, failures);
        }
        true
    }

    fn remove_subscriber(&self, topic: &str, state: &Arc<SubscriberState>) {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| !Arc::ptr_eq(&s.state, state));
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    topic: String,
    subscriber_id: String,
    state: Arc<SubscriberState>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// False after an explicit unsubscribe, a circuit-breaker trip or bus close.
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: &EventsConfig, observer: Arc<dyn DeliveryObserver>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                observer,
                queue_capacity: config.queue_capacity.max(1),
                delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
                failure_threshold: config.failure_threshold.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Queue `payload` for every current subscriber of `topic`; returns how
    /// many subscribers it was queued for.
    #[instrument(skip(self, payload))]
    pub fn publish(
        &self,
        topic: &str,
        payload: Value,
        source: &str,
    ) -> Result<usize, EventBusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        let record = Arc::new(EventRecord {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload,
            source: source.to_string(),
            published_at: Utc::now(),
        });

        let mut full: Vec<(String, Arc<SubscriberState>)> = Vec::new();
        let mut queued = 0usize;
        {
            let topics = self.inner.topics.read();
            let Some(subs) = topics.get(topic) else {
                return Ok(0);
            };
            for sub in subs {
                match sub.tx.try_send(record.clone()) {
                    Ok(()) => queued += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        full.push((sub.id.clone(), sub.state.clone()));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(topic, subscriber_id = %sub.id, "Subscriber worker gone");
                    }
                }
            }
        }
        // outside the read lock: tripping a breaker takes the write lock
        for (id, state) in full {
            self.inner
                .record_failure(topic, &id, &state, DeliveryFailure::QueueFull);
        }
        Ok(queued)
    }

    pub fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn EventHandler>,
        subscriber_id: &str,
    ) -> Result<SubscriptionHandle, EventBusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        let mut topics = self.inner.topics.write();
        let subs = topics.entry(topic.to_string()).or_default();
        if subs.iter().any(|s| s.id == subscriber_id) {
            return Err(EventBusError::AlreadySubscribed {
                topic: topic.to_string(),
                subscriber_id: subscriber_id.to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let state = Arc::new(SubscriberState {
            active: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        });
        subs.push(Subscriber {
            id: subscriber_id.to_string(),
            tx,
            state: state.clone(),
        });

        tokio::spawn(run_subscriber(
            Arc::downgrade(&self.inner),
            topic.to_string(),
            subscriber_id.to_string(),
            handler,
            rx,
            state.clone(),
        ));
        debug!(topic, subscriber_id, "Subscribed");

        Ok(SubscriptionHandle {
            topic: topic.to_string(),
            subscriber_id: subscriber_id.to_string(),
            state,
        })
    }

    /// Returns whether a subscription was removed. Events already queued for
    /// the subscriber are still delivered.
    pub fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> bool {
        let mut topics = self.inner.topics.write();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| {
            if s.id == subscriber_id {
                s.state.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, |subs| subs.len())
    }

    /// Stop accepting publishes and subscriptions. Subscriber tasks drain what
    /// is already queued and then exit.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut topics = self.inner.topics.write();
        for subs in topics.values() {
            for s in subs {
                s.state.active.store(false, Ordering::Release);
            }
        }
        topics.clear();
        info!("Event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn run_subscriber(
    bus: Weak<BusInner>,
    topic: String,
    subscriber_id: String,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::Receiver<Arc<EventRecord>>,
    state: Arc<SubscriberState>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = bus.upgrade() else { break };
        let timeout = inner.delivery_timeout;

        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(handler.handle(event)).catch_unwind(),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(Ok(()))) => {
                state.consecutive_failures.store(0, Ordering::Release);
                continue;
            }
            Ok(Ok(Err(e))) => DeliveryFailure::Error(e.to_string()),
            Ok(Err(_)) => DeliveryFailure::Panicked,
            Err(_) => DeliveryFailure::TimedOut(timeout),
        };

        if inner.record_failure(&topic, &subscriber_id, &state, failure) {
            break;
        }
    }
    debug!(topic = %topic, subscriber_id = %subscriber_id, "Subscriber task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingObserver {
        failures: Mutex<Vec<(String, DeliveryFailure)>>,
        tripped: Mutex<Vec<String>>,
    }

    impl DeliveryObserver for RecordingObserver {
        fn delivery_failed(&self, _topic: &str, subscriber_id: &str, failure: &DeliveryFailure) {
            self.failures
                .lock()
                .push((subscriber_id.to_string(), failure.clone()));
        }

        fn subscriber_tripped(&self, _topic: &str, subscriber_id: &str, _n: u32) {
            self.tripped.lock().push(subscriber_id.to_string());
        }
    }

    fn config(timeout_ms: u64, threshold: u32) -> EventsConfig {
        EventsConfig {
            queue_capacity: 16,
            delivery_timeout_ms: timeout_ms,
            failure_threshold: threshold,
        }
    }

    fn collector() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |event: Arc<EventRecord>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.payload.clone());
                Ok::<_, anyhow::Error>(())
            }
        };
        (Arc::new(handler), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event not delivered in time")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let observer = Arc::new(RecordingObserver::default());
        let bus = EventBus::new(&config(500, 3), observer.clone());

        let failing = |_e: Arc<EventRecord>| async { Err::<(), _>(anyhow::anyhow!("boom")) };
        bus.subscribe("t", Arc::new(failing), "a").unwrap();
        let (b, mut rx) = collector();
        bus.subscribe("t", b, "b").unwrap();

        assert_eq!(bus.publish("t", json!(1), "test").unwrap(), 2);
        assert_eq!(next(&mut rx).await, json!(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let failures = observer.failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "a");
    }

    #[tokio::test]
    async fn test_per_subscriber_fifo() {
        let bus = EventBus::new(&config(500, 3), Arc::new(TracingObserver));
        let (h, mut rx) = collector();
        bus.subscribe("t", h, "s").unwrap();

        for i in 0..10 {
            bus.publish("t", json!(i), "test").unwrap();
        }
        for i in 0..10 {
            assert_eq!(next(&mut rx).await, json!(i));
        }
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_contained() {
        let observer = Arc::new(RecordingObserver::default());
        let bus = EventBus::new(&config(500, 5), observer.clone());
        let panicking = |_e: Arc<EventRecord>| async {
            if true {
                panic!("subscriber bug");
            }
            Ok::<_, anyhow::Error>(())
        };
        bus.subscribe("t", Arc::new(panicking), "p").unwrap();
        let (h, mut rx) = collector();
        bus.subscribe("t", h, "ok").unwrap();

        bus.publish("t", json!("x"), "test").unwrap();
        assert_eq!(next(&mut rx).await, json!("x"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.failures.lock()[0].1, DeliveryFailure::Panicked);
    }

    #[tokio::test]
    async fn test_slow_subscriber_trips_breaker() {
        let observer = Arc::new(RecordingObserver::default());
        let bus = EventBus::new(&config(20, 2), observer.clone());
        let slow = |_e: Arc<EventRecord>| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, anyhow::Error>(())
        };
        let handle = bus.subscribe("t", Arc::new(slow), "slow").unwrap();

        bus.publish("t", json!(1), "test").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.is_active());

        bus.publish("t", json!(2), "test").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_active());
        assert_eq!(bus.subscriber_count("t"), 0);
        assert_eq!(observer.tripped.lock().as_slice(), ["slow".to_string()]);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let observer = Arc::new(RecordingObserver::default());
        let bus = EventBus::new(&config(500, 2), observer.clone());
        let flaky = |e: Arc<EventRecord>| async move {
            if e.payload == json!("bad") {
                Err(anyhow::anyhow!("bad payload"))
            } else {
                Ok(())
            }
        };
        let handle = bus.subscribe("t", Arc::new(flaky), "flaky").unwrap();

        for p in ["bad", "good", "bad", "good"] {
            bus.publish("t", json!(p), "test").unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(handle.is_active());
        assert_eq!(observer.failures.lock().len(), 2);
        assert!(observer.tripped.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_duplicate_ids() {
        let bus = EventBus::new(&config(500, 3), Arc::new(TracingObserver));
        let (h, _rx) = collector();
        let handle = bus.subscribe("t", h.clone(), "s").unwrap();
        assert!(matches!(
            bus.subscribe("t", h.clone(), "s"),
            Err(EventBusError::AlreadySubscribed { .. })
        ));
        // same id on a different topic is a separate subscription
        bus.subscribe("u", h, "s").unwrap();

        assert!(bus.unsubscribe("t", "s"));
        assert!(!handle.is_active());
        assert!(!bus.unsubscribe("t", "s"));
        assert_eq!(bus.publish("t", json!(1), "test").unwrap(), 0);
        assert_eq!(bus.subscriber_count("u"), 1);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = EventBus::new(&config(500, 3), Arc::new(TracingObserver));
        let (h, _rx) = collector();
        let handle = bus.subscribe("t", h.clone(), "s").unwrap();
        bus.close();

        assert!(!handle.is_active());
        assert_eq!(bus.publish("t", json!(1), "test"), Err(EventBusError::Closed));
        assert!(matches!(bus.subscribe("t", h, "s2"), Err(EventBusError::Closed)));
    }
}
