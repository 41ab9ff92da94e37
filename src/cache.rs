//! Execution snapshot cache: TTL + LRU, observable, single-flight misses.

use crate::channel::{EventChannel, EventStream, LatestStream, LatestValue};
use crate::clock::{Clock, MonotonicClock};
use crate::config::CacheConfig;
use crate::error::ClientError;
use crate::snapshot::ExecutionSnapshot;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

/// Why an entry left the cache without being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Displaced as least-recently-used when the cache was full.
    Capacity,
    /// Outlived the TTL.
    Expired,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictReason::Capacity => f.write_str("capacity"),
            EvictReason::Expired => f.write_str("expired"),
        }
    }
}

/// Cache lifecycle events. `Invalidated { id: "*" }` is the single event for
/// a full invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { id: String },
    Miss { id: String },
    Evicted { id: String, reason: EvictReason },
    Invalidated { id: String },
}

/// Point-in-time cache statistics, published on every operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheMetrics {
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub size: usize,
}

/// Per-id watch stream: `Some(snapshot)` on set, `None` while uncached.
pub type CacheWatchStream = LatestStream<Option<ExecutionSnapshot>>;

struct Entry {
    snapshot: ExecutionSnapshot,
    inserted_at: u64,
    last_accessed: u64,
}

struct CacheInner {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    watches: Mutex<HashMap<String, Arc<LatestValue<Option<ExecutionSnapshot>>>>>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: EventChannel<CacheEvent>,
    metrics: LatestValue<CacheMetrics>,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded TTL + LRU map of execution snapshots.
///
/// All mutations serialize on one lock; upstream fetches for misses run
/// outside it under a per-id single-flight guard, so concurrent misses on
/// the same id produce exactly one fetch.
#[derive(Clone)]
pub struct ExecutionCache {
    inner: Arc<CacheInner>,
}

impl ExecutionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock for deterministic TTL tests.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(CacheInner {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            events: EventChannel::new(),
            metrics: LatestValue::seeded(CacheMetrics {
                hit_count: 0,
                miss_count: 0,
                hit_rate: 0.0,
                size: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        });

        let weak: Weak<CacheInner> = Arc::downgrade(&inner);
        let period = inner.config.sweep_every;
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // the immediate first tick sweeps nothing
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.sweep_expired();
            }
        });
        *inner.sweeper.lock().unwrap_or_else(|p| p.into_inner()) = Some(sweeper);

        Self { inner }
    }

    /// Cached snapshot for `id`, fetching on a miss.
    ///
    /// A hit refreshes the LRU stamp and publishes `Hit`. A miss publishes
    /// `Miss`, runs `fetch` (coalesced across concurrent callers), inserts
    /// the result, then publishes `Hit` for the insert's read-back.
    pub async fn get_with<F, Fut>(&self, id: &str, fetch: F) -> Result<ExecutionSnapshot, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionSnapshot, ClientError>>,
    {
        if let Some(snapshot) = self.inner.lookup(id) {
            return Ok(snapshot);
        }

        let gate = self.flight_gate(id);
        let _guard = gate.lock().await;

        // Another caller may have completed the fetch while we waited.
        if let Some(snapshot) = self.inner.lookup(id) {
            return Ok(snapshot);
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.inner.publish_event(CacheEvent::Miss { id: id.to_string() });

        let fetched = fetch().await;
        self.inner.inflight.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
        let snapshot = fetched?;
        self.set(id, snapshot.clone());

        // Read the insert back so the hit is observable; if a concurrent
        // invalidation razed it already, the fetched value still stands.
        Ok(self.inner.lookup(id).unwrap_or(snapshot))
    }

    /// Cached snapshot without fetching; still counts as hit or miss.
    pub fn peek(&self, id: &str) -> Option<ExecutionSnapshot> {
        match self.inner.lookup(id) {
            Some(snapshot) => Some(snapshot),
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.inner.publish_event(CacheEvent::Miss { id: id.to_string() });
                None
            }
        }
    }

    /// Insert or overwrite, evicting the LRU entry when over capacity.
    pub fn set(&self, id: &str, snapshot: ExecutionSnapshot) {
        let inner = &self.inner;
        let now = inner.clock.now_millis();
        let evicted = {
            let mut entries = inner.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.insert(
                id.to_string(),
                Entry { snapshot: snapshot.clone(), inserted_at: now, last_accessed: now },
            );
            if entries.len() > inner.config.capacity {
                let victim = entries
                    .iter()
                    .filter(|(key, _)| key.as_str() != id)
                    .min_by_key(|(_, e)| e.last_accessed)
                    .map(|(key, _)| key.clone());
                if let Some(key) = &victim {
                    entries.remove(key);
                }
                victim
            } else {
                None
            }
        };
        if let Some(victim) = evicted {
            inner.notify_watch(&victim, None);
            inner.publish_event(CacheEvent::Evicted { id: victim, reason: EvictReason::Capacity });
        }
        inner.notify_watch(id, Some(snapshot));
        inner.publish_metrics();
    }

    /// Remove one entry, if present.
    pub fn invalidate(&self, id: &str) {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.remove(id).is_some()
        };
        if removed {
            self.inner.notify_watch(id, None);
            self.inner.publish_event(CacheEvent::Invalidated { id: id.to_string() });
        }
    }

    /// Drop everything; publishes a single `Invalidated { id: "*" }`.
    pub fn invalidate_all(&self) {
        let keys: Vec<String> = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.drain().map(|(key, _)| key).collect()
        };
        for key in &keys {
            self.inner.notify_watch(key, None);
        }
        self.inner.publish_event(CacheEvent::Invalidated { id: "*".to_string() });
    }

    /// Remove every entry whose id matches; one event per removed key.
    pub fn invalidate_matching(&self, predicate: impl Fn(&str) -> bool) {
        let keys: Vec<String> = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|p| p.into_inner());
            let keys: Vec<String> =
                entries.keys().filter(|key| predicate(key)).cloned().collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };
        for key in keys {
            self.inner.notify_watch(&key, None);
            self.inner.publish_event(CacheEvent::Invalidated { id: key });
        }
    }

    /// Bulk fetch: warms every id that is not already cached.
    pub async fn prewarm<F, Fut>(&self, ids: &[String], fetch: F) -> Result<(), ClientError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<ExecutionSnapshot, ClientError>>,
    {
        for id in ids {
            self.get_with(id, || fetch(id.clone())).await?;
        }
        Ok(())
    }

    /// Live view of one id: the current value (or `None`) first, then every
    /// set and invalidation.
    pub fn watch(&self, id: &str) -> CacheWatchStream {
        let channel = {
            let mut watches = self.inner.watches.lock().unwrap_or_else(|p| p.into_inner());
            match watches.get(id) {
                Some(channel) => Arc::clone(channel),
                None => {
                    // Seed with whatever is cached right now, without
                    // counting a hit. Taking the entries lock inside the
                    // watches lock is safe: no writer holds them reversed.
                    let current = self
                        .inner
                        .entries
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .get(id)
                        .map(|e| e.snapshot.clone());
                    let channel = Arc::new(LatestValue::seeded(current));
                    watches.insert(id.to_string(), Arc::clone(&channel));
                    channel
                }
            }
        };
        channel.subscribe()
    }

    /// Cache events from now on.
    pub fn events(&self) -> EventStream<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Metrics as latest value plus changes.
    pub fn metrics(&self) -> LatestStream<CacheMetrics> {
        self.inner.metrics.subscribe()
    }

    /// Current metrics.
    pub fn metrics_snapshot(&self) -> CacheMetrics {
        self.inner.compute_metrics()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweeper and terminate all event and watch subscribers.
    pub fn close(&self) {
        if let Some(handle) = self.inner.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take()
        {
            handle.abort();
        }
        self.inner.events.close();
        self.inner.metrics.close();
        let watches = self.inner.watches.lock().unwrap_or_else(|p| p.into_inner());
        for channel in watches.values() {
            channel.close();
        }
    }

    fn flight_gate(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inner.inflight.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            inflight
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

impl CacheInner {
    /// Fresh lookup: refreshes the LRU stamp and publishes `Hit`; expired
    /// entries are evicted on contact.
    fn lookup(&self, id: &str) -> Option<ExecutionSnapshot> {
        let now = self.clock.now_millis();
        let ttl = self.config.ttl.as_millis() as u64;
        let outcome = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            match entries.get_mut(id) {
                Some(entry) if now.saturating_sub(entry.inserted_at) < ttl => {
                    entry.last_accessed = now;
                    Some(Some(entry.snapshot.clone()))
                }
                Some(_) => {
                    entries.remove(id);
                    Some(None)
                }
                None => None,
            }
        };
        match outcome {
            Some(Some(snapshot)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.publish_event(CacheEvent::Hit { id: id.to_string() });
                Some(snapshot)
            }
            Some(None) => {
                self.notify_watch(id, None);
                self.publish_event(CacheEvent::Evicted {
                    id: id.to_string(),
                    reason: EvictReason::Expired,
                });
                None
            }
            None => None,
        }
    }

    fn sweep_expired(&self) {
        let now = self.clock.now_millis();
        let ttl = self.config.ttl.as_millis() as u64;
        let expired: Vec<String> = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now.saturating_sub(e.inserted_at) >= ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };
        for key in expired {
            tracing::debug!(id = %key, "cache entry expired");
            self.notify_watch(&key, None);
            self.publish_event(CacheEvent::Evicted { id: key, reason: EvictReason::Expired });
        }
    }

    fn notify_watch(&self, id: &str, value: Option<ExecutionSnapshot>) {
        let watches = self.watches.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(channel) = watches.get(id) {
            channel.publish(value);
        }
    }

    fn compute_metrics(&self) -> CacheMetrics {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        CacheMetrics {
            hit_count,
            miss_count,
            hit_rate: if total == 0 { 0.0 } else { hit_count as f64 / total as f64 },
            size: self.entries.lock().unwrap_or_else(|p| p.into_inner()).len(),
        }
    }

    fn publish_event(&self, event: CacheEvent) {
        self.events.publish(event);
        self.publish_metrics();
    }

    fn publish_metrics(&self) {
        self.metrics.publish(self.compute_metrics());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::status::ExecutionStatus;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn snapshot(id: &str, status: ExecutionStatus) -> ExecutionSnapshot {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": status.as_wire(),
        }))
        .unwrap()
    }

    fn cache(capacity: usize, ttl: Duration) -> (ExecutionCache, ManualClock) {
        let clock = ManualClock::new();
        let cache = ExecutionCache::with_clock(
            CacheConfig { ttl, capacity, sweep_every: Duration::from_secs(3600) },
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    fn drain(events: &mut EventStream<CacheEvent>) -> Vec<CacheEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.try_next() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn miss_fetch_then_hit() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        let mut events = cache.events();
        let fetches = AtomicU32::new(0);

        let snap = cache
            .get_with("e1", || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(snapshot("e1", ExecutionStatus::Running)) }
            })
            .await
            .unwrap();
        assert_eq!(snap.id, "e1");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            drain(&mut events),
            vec![
                CacheEvent::Miss { id: "e1".into() },
                CacheEvent::Hit { id: "e1".into() },
            ],
            "miss, then hit on the insert's read-back"
        );

        // Second get: pure hit, no fetch.
        let _ = cache
            .get_with("e1", || {
                fetches.fetch_add(1, Ordering::SeqCst);
                async { Ok(snapshot("e1", ExecutionStatus::Running)) }
            })
            .await
            .unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut events), vec![CacheEvent::Hit { id: "e1".into() }]);
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                cache
                    .get_with("e1", || {
                        let fetches = Arc::clone(&fetches);
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(snapshot("e1", ExecutionStatus::Running))
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1, "single-flight");
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let (cache, clock) = cache(2, Duration::from_secs(60));
        cache.set("a", snapshot("a", ExecutionStatus::Running));
        clock.advance(1);
        cache.set("b", snapshot("b", ExecutionStatus::Running));
        clock.advance(1);

        // Touch "a" so "b" becomes the LRU victim.
        assert!(cache.peek("a").is_some());
        clock.advance(1);

        let mut events = cache.events();
        cache.set("c", snapshot("c", ExecutionStatus::Running));

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("b").is_none());
        assert!(drain(&mut events).contains(&CacheEvent::Evicted {
            id: "b".into(),
            reason: EvictReason::Capacity
        }));
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let (cache, clock) = cache(3, Duration::from_secs(60));
        for i in 0..20 {
            cache.set(&format!("e{i}"), snapshot(&format!("e{i}"), ExecutionStatus::Running));
            clock.advance(1);
            assert!(cache.len() <= 3, "len {} after insert {i}", cache.len());
        }
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let (cache, clock) = cache(10, Duration::from_secs(30));
        cache.set("e1", snapshot("e1", ExecutionStatus::Running));
        assert!(cache.peek("e1").is_some());

        clock.advance(30_000);
        let mut events = cache.events();
        assert!(cache.peek("e1").is_none());
        let seen = drain(&mut events);
        assert!(seen.contains(&CacheEvent::Evicted {
            id: "e1".into(),
            reason: EvictReason::Expired
        }));
    }

    #[tokio::test]
    async fn invalidate_publishes_and_clears_watch() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        cache.set("e1", snapshot("e1", ExecutionStatus::Running));

        let mut watch = cache.watch("e1");
        assert_eq!(watch.next().await.unwrap().unwrap().id, "e1");

        let mut events = cache.events();
        cache.invalidate("e1");
        assert_eq!(watch.next().await, Some(None), "watch sees the invalidation");
        assert_eq!(drain(&mut events), vec![CacheEvent::Invalidated { id: "e1".into() }]);

        // Invalidating an absent id publishes nothing.
        cache.invalidate("e1");
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn invalidate_all_emits_one_star_event() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        cache.set("a", snapshot("a", ExecutionStatus::Running));
        cache.set("b", snapshot("b", ExecutionStatus::Running));

        let mut events = cache.events();
        cache.invalidate_all();
        assert_eq!(cache.len(), 0);
        assert_eq!(drain(&mut events), vec![CacheEvent::Invalidated { id: "*".into() }]);
    }

    #[tokio::test]
    async fn invalidate_matching_emits_per_key() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        cache.set("wf1-a", snapshot("wf1-a", ExecutionStatus::Running));
        cache.set("wf1-b", snapshot("wf1-b", ExecutionStatus::Running));
        cache.set("wf2-c", snapshot("wf2-c", ExecutionStatus::Running));

        let mut events = cache.events();
        cache.invalidate_matching(|id| id.starts_with("wf1-"));

        assert_eq!(cache.len(), 1);
        assert!(cache.peek("wf2-c").is_some());
        let seen = drain(&mut events);
        let invalidations =
            seen.iter().filter(|e| matches!(e, CacheEvent::Invalidated { .. })).count();
        assert_eq!(invalidations, 2);
    }

    #[tokio::test]
    async fn watch_seeds_with_current_state() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));

        let mut cold = cache.watch("e1");
        assert_eq!(cold.next().await, Some(None), "uncached id seeds with None");

        cache.set("e1", snapshot("e1", ExecutionStatus::Running));
        assert_eq!(cold.next().await.unwrap().unwrap().id, "e1");

        let mut warm = cache.watch("e1");
        assert_eq!(warm.next().await.unwrap().unwrap().id, "e1", "late watch seeds with value");
    }

    #[tokio::test]
    async fn metrics_track_hits_misses_and_size() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        cache.set("e1", snapshot("e1", ExecutionStatus::Running));

        assert!(cache.peek("e1").is_some());
        assert!(cache.peek("nope").is_none());

        let metrics = cache.metrics_snapshot();
        assert_eq!(metrics.hit_count, 1);
        assert_eq!(metrics.miss_count, 1);
        assert!((metrics.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(metrics.size, 1);
    }

    #[tokio::test]
    async fn prewarm_fetches_only_uncached_ids() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        cache.set("a", snapshot("a", ExecutionStatus::Running));
        let fetches = AtomicU32::new(0);

        cache
            .prewarm(&["a".into(), "b".into()], |id| {
                fetches.fetch_add(1, Ordering::SeqCst);
                async move { Ok(snapshot(&id, ExecutionStatus::Running)) }
            })
            .await
            .unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1, "only the cold id was fetched");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_entries() {
        let clock = ManualClock::new();
        let cache = ExecutionCache::with_clock(
            CacheConfig {
                ttl: Duration::from_secs(10),
                capacity: 10,
                sweep_every: Duration::from_millis(100),
            },
            Arc::new(clock.clone()),
        );
        cache.set("e1", snapshot("e1", ExecutionStatus::Running));
        let mut events = cache.events();

        clock.advance(10_000);
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(cache.len(), 0);
        let seen = drain(&mut events);
        assert!(seen.contains(&CacheEvent::Evicted {
            id: "e1".into(),
            reason: EvictReason::Expired
        }));
    }

    #[tokio::test]
    async fn close_terminates_event_subscribers() {
        let (cache, _clock) = cache(10, Duration::from_secs(60));
        let mut events = cache.events();
        cache.close();
        assert!(events.next().await.is_none());
    }
}
