/// Cache event notifications.
///
/// Every cache mutation (and every hit) publishes a [`CacheEvent`] on a
/// [`CacheEventBus`]. Listeners are called synchronously, in registration
/// order, at most once per publish. A listener that returns an error or
/// panics is logged and skipped; the remaining listeners still run and the
/// publisher never sees the failure.
///
/// The listener list has its own lock, and that lock is released before any
/// listener runs, so listeners may subscribe or unsubscribe from inside a
/// callback. Listeners must not call back into the cache that published the
/// event.
///
/// # Example
///
/// ```ignore
/// use koru_recall::events::{CacheEventBus, CacheEventKind, EventCounter};
///
/// let bus = CacheEventBus::new();
/// let counter = Arc::new(EventCounter::new());
/// bus.subscribe(counter.clone());
///
/// bus.subscribe(Arc::new(|event: &CacheEvent| {
///     println!("{} on {}", event.kind, event.cache_id);
///     Ok(())
/// }));
///
/// // ... use caches wired to `bus` ...
/// println!("evictions so far: {}", counter.count(CacheEventKind::Evict));
/// ```
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Unique identifier for a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEventKind {
    Get,
    Put,
    Delete,
    Clear,
    Promote,
    Demote,
    /// An entry left the cache (hard eviction)
    Evict,
    /// A maintenance task or pass updated weights
    Maintenance,
    Error,
    /// A cache or the memory core came up
    Init,
}

impl CacheEventKind {
    /// All kinds, in declaration order.
    pub const ALL: [CacheEventKind; 10] = [
        CacheEventKind::Get,
        CacheEventKind::Put,
        CacheEventKind::Delete,
        CacheEventKind::Clear,
        CacheEventKind::Promote,
        CacheEventKind::Demote,
        CacheEventKind::Evict,
        CacheEventKind::Maintenance,
        CacheEventKind::Error,
        CacheEventKind::Init,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEventKind::Get => "get",
            CacheEventKind::Put => "put",
            CacheEventKind::Delete => "delete",
            CacheEventKind::Clear => "clear",
            CacheEventKind::Promote => "promote",
            CacheEventKind::Demote => "demote",
            CacheEventKind::Evict => "evict",
            CacheEventKind::Maintenance => "maintenance",
            CacheEventKind::Error => "error",
            CacheEventKind::Init => "init",
        }
    }
}

impl std::fmt::Display for CacheEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache event notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    /// Which cache published it
    pub cache_id: String,
    pub key: Option<String>,
    pub value: Option<JsonValue>,
    /// Kind-specific detail (levels, weights, error text)
    pub metadata: Option<JsonValue>,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    /// Create an event stamped now.
    pub fn new(kind: CacheEventKind, cache_id: impl Into<String>) -> Self {
        Self {
            kind,
            cache_id: cache_id.into(),
            key: None,
            value: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the affected key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach the affected value.
    pub fn value(mut self, value: JsonValue) -> Self {
        self.value = Some(value);
        self
    }

    /// Attach metadata.
    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Something that wants to hear about cache events.
pub trait CacheListener: Send + Sync {
    /// Handle one event. Errors are logged by the bus and otherwise ignored.
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()>;
}

impl<F> CacheListener for F
where
    F: Fn(&CacheEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()> {
        self(event)
    }
}

struct Registration {
    id: ListenerId,
    listener: Arc<dyn CacheListener>,
    /// None = every kind
    kinds: Option<Vec<CacheEventKind>>,
}

impl Registration {
    fn wants(&self, kind: CacheEventKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Counters for the bus itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub listeners: usize,
    pub published: u64,
    pub delivered: u64,
    pub failures: u64,
}

/// Synchronous, ordered event fan-out.
pub struct CacheEventBus {
    listeners: RwLock<Vec<Arc<Registration>>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for CacheEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEventBus")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CacheEventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn register(
        &self,
        listener: Arc<dyn CacheListener>,
        kinds: Option<Vec<CacheEventKind>>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let registration = Arc::new(Registration {
            id,
            listener,
            kinds,
        });
        match self.listeners.write() {
            Ok(mut guard) => guard.push(registration),
            Err(poisoned) => poisoned.into_inner().push(registration),
        }
        id
    }

    /// Register a listener for every event.
    pub fn subscribe(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        self.register(listener, None)
    }

    /// Register a listener for some kinds only.
    pub fn subscribe_kinds(
        &self,
        kinds: &[CacheEventKind],
        listener: Arc<dyn CacheListener>,
    ) -> ListenerId {
        self.register(listener, Some(kinds.to_vec()))
    }

    /// Forward events into a broadcast channel.
    ///
    /// Slow receivers lag and lose events; the bus never waits for them.
    pub fn channel(&self, capacity: usize) -> (ListenerId, broadcast::Receiver<CacheEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        let id = self.subscribe(Arc::new(move |event: &CacheEvent| -> anyhow::Result<()> {
            // No receivers left is not an error worth reporting.
            let _ = sender.send(event.clone());
            Ok(())
        }));
        (id, receiver)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.len();
        guard.retain(|registration| registration.id != id);
        guard.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver an event to every interested listener.
    ///
    /// Returns how many listeners handled it without error.
    pub fn publish(&self, event: &CacheEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot, then deliver without holding the list lock.
        let snapshot: Vec<Arc<Registration>> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut handled = 0;
        for registration in snapshot.iter().filter(|r| r.wants(event.kind)) {
            let outcome = catch_unwind(AssertUnwindSafe(|| registration.listener.on_event(event)));
            match outcome {
                Ok(Ok(())) => handled += 1,
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        listener = %registration.id,
                        kind = %event.kind,
                        error = %e,
                        "Cache listener failed"
                    );
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        listener = %registration.id,
                        kind = %event.kind,
                        "Cache listener panicked"
                    );
                }
            }
        }

        self.delivered.fetch_add(handled as u64, Ordering::Relaxed);
        trace!(kind = %event.kind, cache = %event.cache_id, handled, "Published cache event");
        handled
    }

    /// Bus counters.
    pub fn stats(&self) -> BusStats {
        BusStats {
            listeners: self.listener_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for CacheEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener that counts events per kind.
#[derive(Debug, Default)]
pub struct EventCounter {
    counts: DashMap<CacheEventKind, u64>,
}

impl EventCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen of one kind.
    pub fn count(&self, kind: CacheEventKind) -> u64 {
        self.counts.get(&kind).map_or(0, |count| *count)
    }

    /// Events seen in total.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    /// Non-zero counts keyed by kind name.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect()
    }

    pub fn reset(&self) {
        self.counts.clear();
    }
}

impl CacheListener for EventCounter {
    fn on_event(&self, event: &CacheEvent) -> anyhow::Result<()> {
        *self.counts.entry(event.kind).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn CacheListener> {
        Arc::new(move |event: &CacheEvent| -> anyhow::Result<()> {
            log.lock().unwrap().push(format!("{name}:{}", event.kind));
            Ok(())
        })
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = CacheEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(recorder(log.clone(), "a"));
        bus.subscribe(recorder(log.clone(), "b"));
        bus.subscribe(recorder(log.clone(), "c"));

        let handled = bus.publish(&CacheEvent::new(CacheEventKind::Put, "hot").key("k"));
        assert_eq!(handled, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:put", "b:put", "c:put"]);
    }

    #[test]
    fn test_failing_listeners_do_not_block_others() {
        let bus = CacheEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Arc::new(|_: &CacheEvent| -> anyhow::Result<()> {
            anyhow::bail!("listener error")
        }));
        bus.subscribe(Arc::new(|_: &CacheEvent| -> anyhow::Result<()> {
            panic!("listener panic")
        }));
        bus.subscribe(recorder(log.clone(), "last"));

        let handled = bus.publish(&CacheEvent::new(CacheEventKind::Evict, "cold"));
        assert_eq!(handled, 1);
        assert_eq!(*log.lock().unwrap(), vec!["last:evict"]);

        let stats = bus.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = CacheEventBus::new();
        let counter = Arc::new(EventCounter::new());
        let id = bus.subscribe(counter.clone());

        bus.publish(&CacheEvent::new(CacheEventKind::Get, "hot"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&CacheEvent::new(CacheEventKind::Get, "hot"));

        assert_eq!(counter.count(CacheEventKind::Get), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_kind_filter() {
        let bus = CacheEventBus::new();
        let counter = Arc::new(EventCounter::new());
        bus.subscribe_kinds(&[CacheEventKind::Evict], counter.clone());

        bus.publish(&CacheEvent::new(CacheEventKind::Put, "hot"));
        bus.publish(&CacheEvent::new(CacheEventKind::Evict, "hot"));
        assert_eq!(counter.total(), 1);
        assert_eq!(counter.snapshot().get("evict"), Some(&1));
    }

    #[test]
    fn test_listener_may_subscribe_during_delivery() {
        let bus = Arc::new(CacheEventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(Arc::new(move |_: &CacheEvent| -> anyhow::Result<()> {
            inner.subscribe(Arc::new(EventCounter::new()));
            Ok(())
        }));

        bus.publish(&CacheEvent::new(CacheEventKind::Init, "core"));
        assert_eq!(bus.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_channel() {
        let bus = CacheEventBus::new();
        let (_, mut rx) = bus.channel(8);
        bus.publish(&CacheEvent::new(CacheEventKind::Clear, "warm"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, CacheEventKind::Clear);
        assert_eq!(event.cache_id, "warm");
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let event = CacheEvent::new(CacheEventKind::Maintenance, "core")
            .key("m1")
            .metadata(serde_json::json!({"weight": 4.2}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "maintenance");
        assert_eq!(json["metadata"]["weight"], 4.2);
    }
}
