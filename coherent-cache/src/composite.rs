//! `CompositeCache`: a front/back read-through, write-through cache kept
//! coherent with its back cache via event-driven invalidation.
//!
//! Grounded on `hitbox-backend::composition::CompositionBackend`'s L1/L2
//! shape (read from the near tier, fall through and backfill on miss,
//! write through both tiers, best-effort dual-write error handling via
//! `tracing::warn!`) — generalized here from a static two-tier byte cache
//! into a front cache kept coherent with its back cache by subscribing to
//! its change events, rather than by a fixed TTL.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use coherent_backend::backend::BackCache;
use coherent_backend::subscription::{
    DeactivationEvent, ListenerRole, SubscriptionId, SubscriptionMode, SubscriptionTarget,
};
use coherent_core::event::{ChangeEvent, EventKind};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{instrument, trace, warn};

use crate::config::CompositeConfig;
use crate::control::{ControlTable, KeyGuard};
use crate::deactivate::{describe_role, spawn_deactivation_listener};
use crate::error::CacheError;
use crate::pending::PendingRecord;
use crate::strategy::InvalidationStrategy;

/// Raw hit/miss/invalidation counters for a [`CompositeCache`], independent
/// of the `metrics` feature — available even when that feature is off,
/// only unformatted.
#[derive(Debug, Default)]
pub struct CompositeCacheStatistics {
    /// Reads answered from the front without a back cache call.
    pub hits: u64,
    /// Reads that fell through to the back cache.
    pub misses: u64,
    /// Front entries invalidated by a concurrent back cache event.
    pub invalidations: u64,
}

struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Stats { hits: AtomicU64::new(0), misses: AtomicU64::new(0), invalidations: AtomicU64::new(0) }
    }

    fn snapshot(&self) -> CompositeCacheStatistics {
        CompositeCacheStatistics {
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            invalidations: self.invalidations.load(AtomicOrdering::Relaxed),
        }
    }
}

enum SubscriptionOutcome<V> {
    /// Strategy doesn't maintain per-key subscriptions (`All`, `None`).
    NotApplicable,
    /// A per-key subscription already existed for this key.
    AlreadySubscribed,
    /// A per-key subscription was just established; its priming event's
    /// value is returned so the caller doesn't need a second round trip.
    Primed(Option<V>),
}

struct Inner<K, V, B> {
    front: DashMap<K, V>,
    control: ControlTable<K, V>,
    back: Arc<B>,
    strategy: RwLock<InvalidationStrategy>,
    key_subscriptions: DashMap<K, SubscriptionId>,
    all_subscription: std::sync::Mutex<Option<SubscriptionId>>,
    released: AtomicBool,
    stats: Stats,
}

impl<K, V, B> Inner<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + Send + Sync + 'static,
{
    fn route_event(self: &Arc<Self>, event: ChangeEvent<K, V>) {
        if event.priming {
            return;
        }
        if self.control.offer(&event.key, event.clone()) {
            return;
        }
        self.apply_event(&event);
    }

    fn apply_event(&self, event: &ChangeEvent<K, V>) {
        let strategy = *self.strategy.read().unwrap();
        let front_has_key = self.front.contains_key(&event.key);
        if !strategy.should_invalidate(front_has_key, event) {
            return;
        }
        match (&event.kind, &event.new) {
            (EventKind::Deleted, _) | (_, None) => {
                self.front.remove(&event.key);
            }
            (_, Some(new_value)) => {
                self.front.insert(event.key.clone(), new_value.clone());
            }
        }
        self.stats.invalidations.fetch_add(1, AtomicOrdering::Relaxed);
        #[cfg(feature = "metrics")]
        crate::metrics::record_invalidation();
    }

    async fn ensure_subscribed(
        self: &Arc<Self>,
        key: &K,
    ) -> Result<SubscriptionOutcome<V>, CacheError> {
        let strategy = *self.strategy.read().unwrap();
        if matches!(strategy, InvalidationStrategy::All | InvalidationStrategy::None) {
            return Ok(SubscriptionOutcome::NotApplicable);
        }
        if self.key_subscriptions.contains_key(key) {
            return Ok(SubscriptionOutcome::AlreadySubscribed);
        }

        trace!(?key, role = describe_role(ListenerRole::Invalidate), "establishing per-key subscription");
        let (sink, mut source) = mpsc::unbounded_channel();
        let id = self
            .back
            .subscribe(SubscriptionTarget::Key(key.clone()), SubscriptionMode::Standard, sink)
            .await?;
        self.key_subscriptions.insert(key.clone(), id);

        trace!(?key, role = describe_role(ListenerRole::Priming), "awaiting priming event");
        let priming_value = source.recv().await.and_then(|event| event.new);

        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                this.route_event(event);
            }
        });

        Ok(SubscriptionOutcome::Primed(priming_value))
    }

    /// Write-side validation rule: a lone deferred record is valid only if
    /// it is the kind of mutation the caller's own write would itself have
    /// produced (an Insert or Update, never a Delete).
    fn validate_write(records: &[PendingRecord<K, V>]) -> bool {
        match records {
            [] => true,
            [PendingRecord::Event(event)] => {
                matches!(event.kind, EventKind::Inserted | EventKind::Updated)
            }
            _ => false,
        }
    }

    /// Read-side validation rule: a lone deferred record is valid only if
    /// it is a *synthetic* Insert — the shape a priming event always has
    /// (`ChangeEvent::is_synthetic_insert`). Any real external mutation
    /// racing the read (a non-synthetic Insert/Update, or any Delete)
    /// invalidates the result instead of letting it be cached.
    fn validate_read(records: &[PendingRecord<K, V>]) -> bool {
        match records {
            [] => true,
            [PendingRecord::Event(event)] => event.is_synthetic_insert(),
            _ => false,
        }
    }
}

/// A coherent front/back cache. Cheaply cloneable; every clone shares the
/// same front map, control table, and back cache handle.
pub struct CompositeCache<K, V, B> {
    inner: Arc<Inner<K, V, B>>,
    deactivation_task: Arc<JoinHandle<()>>,
}

impl<K, V, B> Clone for CompositeCache<K, V, B> {
    fn clone(&self) -> Self {
        CompositeCache {
            inner: self.inner.clone(),
            deactivation_task: self.deactivation_task.clone(),
        }
    }
}

impl<K, V, B> CompositeCache<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + Send + Sync + 'static,
{
    /// Builds a composite cache over `back`, establishing whatever
    /// subscription the configured invalidation strategy needs.
    pub async fn new(back: B, config: CompositeConfig) -> Result<Self, CacheError> {
        let back = Arc::new(back);
        let inner = Arc::new(Inner {
            front: DashMap::with_capacity(config.front_capacity_hint),
            control: ControlTable::new(),
            back: back.clone(),
            strategy: RwLock::new(config.invalidation_strategy),
            key_subscriptions: DashMap::new(),
            all_subscription: std::sync::Mutex::new(None),
            released: AtomicBool::new(false),
            stats: Stats::new(),
        });

        if config.invalidation_strategy == InvalidationStrategy::All {
            trace!(role = describe_role(ListenerRole::Invalidate), "establishing all-keys subscription");
            let (sink, mut source) = mpsc::unbounded_channel();
            let id = back.subscribe(SubscriptionTarget::All, SubscriptionMode::Standard, sink).await?;
            *inner.all_subscription.lock().unwrap() = Some(id);
            let routed = inner.clone();
            tokio::spawn(async move {
                while let Some(event) = source.recv().await {
                    routed.route_event(event);
                }
            });
        }

        let on_deleted_inner = inner.clone();
        let on_truncated_inner = inner.clone();
        let deactivation_task = spawn_deactivation_listener(
            back.deactivation_channel(),
            move || {
                let inner = on_deleted_inner.clone();
                async move {
                    inner.front.clear();
                    inner.key_subscriptions.clear();
                    *inner.strategy.write().unwrap() = InvalidationStrategy::None;
                }
            },
            move || {
                let inner = on_truncated_inner.clone();
                async move {
                    inner.front.clear();
                }
            },
        );

        Ok(CompositeCache { inner, deactivation_task: Arc::new(deactivation_task) })
    }

    /// Rejects the call with [`CacheError::Inactive`] once this cache has
    /// been [`CompositeCache::release`]d.
    fn ensure_active(&self) -> Result<(), CacheError> {
        if self.inner.released.load(AtomicOrdering::Acquire) {
            return Err(CacheError::Inactive);
        }
        Ok(())
    }

    /// Finishes a locked read: fetches (or uses the already-primed value),
    /// validates against whatever raced the lock, and updates the front
    /// accordingly. Shared by [`CompositeCache::get`] and
    /// [`CompositeCache::get_all`]'s locked path.
    async fn fetch_and_validate(&self, key: &K, guard: KeyGuard<K, V>) -> Result<Option<V>, CacheError>
    where
        K: std::fmt::Debug,
    {
        let value = match self.inner.ensure_subscribed(key).await? {
            SubscriptionOutcome::Primed(value) => value,
            SubscriptionOutcome::AlreadySubscribed | SubscriptionOutcome::NotApplicable => {
                self.inner.back.get(key).await?
            }
        };

        let pending = guard.drain_pending();
        if Inner::<K, V, B>::validate_read(&pending) {
            if let Some(ref fresh) = value {
                self.inner.front.insert(key.clone(), fresh.clone());
            }
        } else {
            self.inner.front.remove(key);
            self.inner.stats.invalidations.fetch_add(1, AtomicOrdering::Relaxed);
        }
        guard.unlock();
        Ok(value)
    }

    /// Reads a single entry, serving from the front when possible and
    /// read-through/populate-on-miss otherwise.
    #[instrument(skip(self), level = "trace")]
    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheError>
    where
        K: std::fmt::Debug,
    {
        self.ensure_active()?;
        if let Some(value) = self.inner.front.get(key) {
            self.inner.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            #[cfg(feature = "metrics")]
            crate::metrics::record_front_hit();
            return Ok(Some(value.clone()));
        }
        self.inner.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
        #[cfg(feature = "metrics")]
        crate::metrics::record_front_miss();

        let guard = self.inner.control.lock(key).await;
        if let Some(value) = self.inner.front.get(key) {
            return Ok(Some(value.clone()));
        }

        self.fetch_and_validate(key, guard).await
    }

    /// Reads several entries. Acquires each key's lock non-blockingly
    /// (`tryLock`): a key someone else is already working on is fetched
    /// from the back cache without being cached in the front, leaving it
    /// to converge later via the event stream — avoiding the deadlock two
    /// overlapping `get_all` calls could otherwise cause by blocking on
    /// per-key locks in different orders.
    pub async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, CacheError>
    where
        K: std::fmt::Debug,
    {
        self.ensure_active()?;
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.inner.front.get(key) {
                self.inner.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                result.insert(key.clone(), value.clone());
                continue;
            }
            self.inner.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);

            match self.inner.control.try_lock(key) {
                Some(guard) => {
                    if let Some(value) = self.inner.front.get(key) {
                        result.insert(key.clone(), value.clone());
                        continue;
                    }
                    if let Some(value) = self.fetch_and_validate(key, guard).await? {
                        result.insert(key.clone(), value);
                    }
                }
                None => {
                    if let Some(value) = self.inner.back.get(key).await? {
                        result.insert(key.clone(), value);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Writes a single entry through to the back cache, caching it in the
    /// front if the write wasn't invalidated by a concurrent event.
    #[instrument(skip(self, value), level = "trace")]
    pub async fn insert(&self, key: K, value: V) -> Result<(), CacheError>
    where
        K: std::fmt::Debug,
    {
        self.ensure_active()?;
        let guard = self.inner.control.lock(&key).await;
        self.inner.ensure_subscribed(&key).await?;
        if let Err(err) = self.inner.back.insert(key.clone(), value.clone()).await {
            warn!(?err, "back cache insert failed");
            return Err(err.into());
        }

        let pending = guard.drain_pending();
        if Inner::<K, V, B>::validate_write(&pending) {
            self.inner.front.insert(key, value);
        } else {
            self.inner.front.remove(&key);
            self.inner.stats.invalidations.fetch_add(1, AtomicOrdering::Relaxed);
        }
        guard.unlock();
        Ok(())
    }

    /// Writes several entries. Acquires each key's lock non-blockingly,
    /// same as [`CompositeCache::get_all`], and issues a single batched
    /// `back.insert_all` call rather than one `back.insert` per entry.
    /// Keys whose lock couldn't be acquired are still written through, but
    /// left for the event stream to reconcile in the front rather than
    /// being cached here directly.
    pub async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), CacheError>
    where
        K: std::fmt::Debug,
    {
        self.ensure_active()?;
        let mut guards: HashMap<K, KeyGuard<K, V>> = HashMap::with_capacity(entries.len());
        for (key, _) in &entries {
            if let Some(guard) = self.inner.control.try_lock(key) {
                self.inner.ensure_subscribed(key).await?;
                guards.insert(key.clone(), guard);
            }
        }

        if let Err(err) = self.inner.back.insert_all(entries.clone()).await {
            warn!(?err, "back cache insert_all failed");
            return Err(err.into());
        }

        for (key, value) in entries {
            match guards.remove(&key) {
                Some(guard) => {
                    let pending = guard.drain_pending();
                    if Inner::<K, V, B>::validate_write(&pending) {
                        self.inner.front.insert(key, value);
                    } else {
                        self.inner.front.remove(&key);
                        self.inner.stats.invalidations.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    guard.unlock();
                }
                None => {
                    // Degraded path: another call already holds this
                    // key's lock. Leave the front untouched; the event
                    // stream converges it once that call finishes.
                }
            }
        }
        Ok(())
    }

    /// Removes a single entry from both front and back, unconditionally.
    pub async fn remove(&self, key: &K) -> Result<(), CacheError> {
        self.ensure_active()?;
        let guard = self.inner.control.lock(key).await;
        self.inner.back.remove(key).await?;
        self.inner.front.remove(key);
        guard.unlock();
        Ok(())
    }

    /// Empties the back cache's contents without destroying it, and
    /// clears the front to match.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.ensure_active()?;
        self.inner.back.truncate().await?;
        self.inner.front.clear();
        Ok(())
    }

    /// Releases every local resource this cache holds — front entries and
    /// per-key subscriptions — without touching the back cache's data.
    /// Takes the GLOBAL gate exclusively, pausing all per-key calls for
    /// the duration. Idempotent: a cache already released just returns.
    /// Every other operation fails with [`CacheError::Inactive`] from this
    /// point on.
    pub async fn release(&self) -> Result<(), CacheError> {
        if self.inner.released.swap(true, AtomicOrdering::AcqRel) {
            return Ok(());
        }
        let _global = self.inner.control.lock_global().await;
        let ids: Vec<SubscriptionId> =
            self.inner.key_subscriptions.iter().map(|entry| *entry.value()).collect();
        for id in ids {
            trace!(role = describe_role(ListenerRole::Invalidate), "tearing down per-key subscription");
            let _ = self.inner.back.unsubscribe(id).await;
        }
        self.inner.key_subscriptions.clear();
        if let Some(id) = self.inner.all_subscription.lock().unwrap().take() {
            let _ = self.inner.back.unsubscribe(id).await;
        }
        self.inner.front.clear();
        Ok(())
    }

    /// Changes the active invalidation strategy, under the GLOBAL gate so
    /// no in-flight call observes a torn transition.
    pub async fn set_invalidation_strategy(&self, strategy: InvalidationStrategy) -> Result<(), CacheError> {
        self.ensure_active()?;
        let _global = self.inner.control.lock_global().await;
        *self.inner.strategy.write().unwrap() = strategy;
        Ok(())
    }

    /// The active invalidation strategy.
    pub fn invalidation_strategy(&self) -> InvalidationStrategy {
        *self.inner.strategy.read().unwrap()
    }

    /// Number of entries currently cached in the front.
    pub fn front_len(&self) -> usize {
        self.inner.front.len()
    }

    /// Raw hit/miss/invalidation counters (see [`CompositeCacheStatistics`]).
    pub fn stats(&self) -> CompositeCacheStatistics {
        self.inner.stats.snapshot()
    }
}

impl<K, V, B> Drop for CompositeCache<K, V, B> {
    fn drop(&mut self) {
        // Only abort once every handle to the shared state is gone.
        if Arc::strong_count(&self.inner) == 1 {
            self.deactivation_task.abort();
        }
    }
}

/// Reports whether an event represents the kind of mutation a caller's own
/// write would have produced, used by [`Inner::validate_write`]'s test
/// suite to build fixtures without depending on `coherent-mock`.
#[cfg(test)]
fn own_write_event(key: &'static str, old: Option<i32>, new: Option<i32>) -> ChangeEvent<&'static str, i32> {
    let kind = if old.is_some() { EventKind::Updated } else { EventKind::Inserted };
    ChangeEvent::new(kind, key, old, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_mock::MockBackCache;

    async fn cache_with_strategy(
        strategy: InvalidationStrategy,
    ) -> CompositeCache<&'static str, i32, MockBackCache<&'static str, i32>> {
        let back = MockBackCache::new();
        let config = CompositeConfig {
            front_capacity_hint: 0,
            invalidation_strategy: strategy,
            lock_timeout: None,
        };
        CompositeCache::new(back, config).await.unwrap()
    }

    #[tokio::test]
    async fn get_populates_front_via_priming() {
        let back_owned = MockBackCache::new();
        back_owned.insert("a", 1).await.unwrap();
        let config = CompositeConfig {
            front_capacity_hint: 0,
            invalidation_strategy: InvalidationStrategy::Present,
            lock_timeout: None,
        };
        let cache = CompositeCache::new(back_owned, config).await.unwrap();

        assert_eq!(cache.front_len(), 0);
        assert_eq!(cache.get(&"a").await.unwrap(), Some(1));
        assert_eq!(cache.front_len(), 1);
        assert_eq!(cache.get(&"a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let cache = cache_with_strategy(InvalidationStrategy::Present).await;
        cache.insert("a", 1).await.unwrap();
        assert_eq!(cache.get(&"a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn present_strategy_invalidates_only_cached_keys() {
        let strategy = InvalidationStrategy::Present;
        assert!(strategy.should_invalidate(true, &own_write_event("a", Some(1), Some(2))));
        assert!(!strategy.should_invalidate(false, &own_write_event("a", Some(1), Some(2))));
    }

    #[tokio::test]
    async fn clear_empties_front_and_back() {
        let cache = cache_with_strategy(InvalidationStrategy::Present).await;
        cache.insert("a", 1).await.unwrap();
        cache.clear().await.unwrap();
        assert_eq!(cache.front_len(), 0);
        assert_eq!(cache.get(&"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn release_drops_subscriptions_and_front() {
        let cache = cache_with_strategy(InvalidationStrategy::Present).await;
        cache.insert("a", 1).await.unwrap();
        assert_eq!(cache.front_len(), 1);
        cache.release().await.unwrap();
        assert_eq!(cache.front_len(), 0);
    }

    #[tokio::test]
    async fn operations_after_release_are_rejected() {
        let cache = cache_with_strategy(InvalidationStrategy::Present).await;
        cache.insert("a", 1).await.unwrap();
        cache.release().await.unwrap();

        assert!(matches!(cache.get(&"a").await, Err(CacheError::Inactive)));
        assert!(matches!(cache.insert("a", 2).await, Err(CacheError::Inactive)));
        assert!(matches!(cache.remove(&"a").await, Err(CacheError::Inactive)));
        assert!(matches!(cache.clear().await, Err(CacheError::Inactive)));
        // A second release is a no-op, not an error.
        assert!(cache.release().await.is_ok());
    }

    #[tokio::test]
    async fn stats_track_hits_misses_and_invalidations() {
        let back = Arc::new(MockBackCache::new());
        back.insert("a", 1).await.unwrap();
        let config = CompositeConfig {
            front_capacity_hint: 0,
            invalidation_strategy: InvalidationStrategy::Present,
            lock_timeout: None,
        };
        let cache = CompositeCache::new(back.clone(), config).await.unwrap();

        cache.get(&"a").await.unwrap();
        let after_miss = cache.stats();
        assert_eq!(after_miss.misses, 1);
        assert_eq!(after_miss.hits, 0);

        cache.get(&"a").await.unwrap();
        let after_hit = cache.stats();
        assert_eq!(after_hit.hits, 1);

        back.external_insert("a", 2).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let after_invalidation = cache.stats();
        assert_eq!(after_invalidation.invalidations, 1);
    }

    #[test]
    fn validate_read_requires_a_synthetic_insert() {
        let priming = PendingRecord::Event(ChangeEvent::priming("a", Some(1)));
        assert!(Inner::<&str, i32, MockBackCache<&str, i32>>::validate_read(&[priming]));

        let real_update = PendingRecord::Event(own_write_event("a", Some(1), Some(2)));
        assert!(!Inner::<&str, i32, MockBackCache<&str, i32>>::validate_read(&[real_update]));
    }

    #[test]
    fn validate_write_accepts_insert_or_update_regardless_of_synthetic() {
        let insert = PendingRecord::Event(own_write_event("a", None, Some(1)));
        assert!(Inner::<&str, i32, MockBackCache<&str, i32>>::validate_write(&[insert]));

        let delete = PendingRecord::Event(ChangeEvent::new(EventKind::Deleted, "a", Some(1), None));
        assert!(!Inner::<&str, i32, MockBackCache<&str, i32>>::validate_write(&[delete]));
    }

    #[tokio::test]
    async fn concurrent_external_write_invalidates_front_after_get() {
        let back = Arc::new(MockBackCache::new());
        back.insert("a", 1).await.unwrap();
        let config = CompositeConfig {
            front_capacity_hint: 0,
            invalidation_strategy: InvalidationStrategy::Present,
            lock_timeout: None,
        };
        let cache = CompositeCache::new(back.clone(), config).await.unwrap();
        assert_eq!(cache.get(&"a").await.unwrap(), Some(1));

        back.external_insert("a", 2).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cache.get(&"a").await.unwrap(), Some(2));
    }
}
