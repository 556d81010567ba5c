//! `ContinuousQueryCache`: a materialized view of the back cache, filtered
//! by a predicate and continuously kept in sync with it.
//!
//! Built fresh in the same `Arc<Inner>` / typed-error idiom as
//! `composite.rs`, reusing `EventDispatcher` for asynchronous listener
//! fan-out and a dedicated lock to bracket (re)configuration against
//! concurrent reads and writes.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use coherent_backend::backend::{Aggregator, BackCache, EntryProcessor, ValueExtractor};
use coherent_backend::subscription::{ListenerRole, SubscriptionId, SubscriptionMode, SubscriptionTarget};
use coherent_core::event::{ChangeEvent, EventKind};
use coherent_core::filter::{BoxFilter, EventFilter, EventMask, FilterExpr, merge_filters};
use coherent_core::state::CacheState;
use coherent_core::transform::{BoxTransformer, strip_old_value};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{instrument, trace, warn};

use crate::config::CqcConfig;
use crate::deactivate::{describe_role, spawn_deactivation_listener};
use crate::dispatcher::{EventDispatcher, ListenerFn};
use crate::error::CacheError;

/// Every event kind a view's merged add/remove subscription needs to see —
/// the subscription plays both `ListenerRole::AddToView` and
/// `ListenerRole::RemoveFromView` at once (see `Inner::reconfigure`).
const VIEW_EVENT_MASK: EventMask = EventMask::INSERTED
    .union(EventMask::UPDATED_ENTERED)
    .union(EventMask::UPDATED_LEFT)
    .union(EventMask::UPDATED_WITHIN)
    .union(EventMask::DELETED);

/// A key's membership-transition relative to the view's filter, derived
/// locally from an event's old/new values — the event model's
/// `kind ∈ {Inserted, Updated, Deleted}` doesn't carry the richer
/// `UpdatedEntered`/`UpdatedLeft`/`UpdatedWithin` distinction an
/// `EventMask` names, so the view classifies each event against its own
/// filter to recover it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// The key did not satisfy the filter before and does now.
    Entered,
    /// The key satisfied the filter before and no longer does (including
    /// deletion).
    Left,
    /// The key satisfied the filter both before and after.
    Within,
    /// The key never satisfied the filter; irrelevant to this view.
    Ignore,
}

/// Checks the FSM is still in `expected` state, failing with
/// [`CacheError::InvalidStateTransition`] otherwise — the signal a
/// concurrent deactivation raced a (re)configuration step out from under
/// it (e.g. the back cache was deleted mid-`reconfigure`).
fn expect_state(actual: CacheState, expected: CacheState) -> Result<(), CacheError> {
    if actual == expected {
        Ok(())
    } else {
        Err(CacheError::InvalidStateTransition { from: actual })
    }
}

fn classify<K, V>(filter: &BoxFilter<K, V>, event: &ChangeEvent<K, V>) -> Transition
where
    K: Send + Sync,
    V: Send + Sync,
{
    let old_matches = filter.evaluate(&event.key, event.old.as_ref());
    let new_matches = match event.kind {
        EventKind::Deleted => false,
        _ => filter.evaluate(&event.key, event.new.as_ref()),
    };
    match (old_matches, new_matches) {
        (false, true) => Transition::Entered,
        (true, false) => Transition::Left,
        (true, true) => Transition::Within,
        (false, false) => Transition::Ignore,
    }
}

/// Opaque handle for a registered `addCacheListener` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Opaque handle for a locally-registered index (`addIndex`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexId(u64);

/// How an `addCacheListener` callback wants events delivered.
#[derive(Clone)]
pub struct CacheListenerOptions<K, V> {
    /// Further narrows which member events this listener sees, in addition
    /// to the view's own filter.
    pub filter: Option<BoxFilter<K, V>>,
    /// `true` drops old values from delivered events (the "lite" form).
    /// `false` requires the view to carry values locally — see
    /// [`ContinuousQueryCache::add_cache_listener`].
    pub lite: bool,
    /// `true` runs the callback inline on the event-ingest path (the
    /// priming listener category); `false` routes it through the
    /// [`EventDispatcher`].
    pub synchronous: bool,
}

impl<K, V> Default for CacheListenerOptions<K, V> {
    fn default() -> Self {
        CacheListenerOptions { filter: None, lite: true, synchronous: false }
    }
}

struct ListenerRegistration<K, V> {
    callback: ListenerFn<K, V>,
    filter: Option<BoxFilter<K, V>>,
    lite: bool,
    synchronous: bool,
}

/// Raw hit/miss/invalidation counters, independent of the `metrics`
/// feature — available even when that feature is off, only unformatted.
#[derive(Debug, Default)]
pub struct CacheStatistics {
    /// Reads answered from local storage.
    pub hits: u64,
    /// Reads that fell through to the back cache.
    pub misses: u64,
    /// Entries invalidated by a concurrent back cache event.
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

    fn snapshot(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            invalidations: self.invalidations.load(AtomicOrdering::Relaxed),
        }
    }
}

struct Inner<K, V, B> {
    back: Arc<B>,
    filter: BoxFilter<K, V>,
    cache_values: AtomicBool,
    read_only: AtomicBool,
    transformer: Option<BoxTransformer<V, V>>,
    reconnect_interval: Duration,
    state: RwLock<CacheState>,
    disconnected_at: Mutex<Option<Instant>>,
    deferred: Mutex<HashSet<K>>,
    storage: DashMap<K, Option<V>>,
    dispatcher: EventDispatcher<K, V>,
    listeners: DashMap<ListenerId, ListenerRegistration<K, V>>,
    next_listener_id: AtomicU64,
    indexes: DashMap<IndexId, ()>,
    next_index_id: AtomicU64,
    view_subscription: Mutex<Option<SubscriptionId>>,
    reconfigure_lock: tokio::sync::Mutex<()>,
    sync_notify: Notify,
    stats: Stats,
}

impl<K, V, B> Inner<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + Send + Sync + 'static,
{
    fn set_state(&self, state: CacheState) {
        *self.state.write().unwrap() = state;
    }

    fn state(&self) -> CacheState {
        *self.state.read().unwrap()
    }

    /// Applies the view's value-storage policy: `None` whenever
    /// `cache_values` is off (the key is a member, but no value is
    /// cached); otherwise the configured transformer's output if one is
    /// set (`CqcConfig`'s transformer is a fixed `V -> V` signature), or
    /// the back's value unchanged.
    fn store_value(&self, value: Option<V>) -> Option<V> {
        if !self.cache_values.load(AtomicOrdering::Acquire) {
            return None;
        }
        match (&self.transformer, value) {
            (Some(transformer), Some(value)) => Some(transformer.apply(value)),
            (_, value) => value,
        }
    }

    fn merged_filter(&self, other: BoxFilter<K, V>) -> BoxFilter<K, V>
    where
        K: PartialEq,
    {
        merge_filters(FilterExpr::Leaf(self.filter.clone()), FilterExpr::Leaf(other)).into_filter()
    }

    /// The event-ingest path for the view's own add/remove-to-view
    /// subscription. During (re)configuration, every incoming event's key
    /// is only recorded in the deferred set instead of being applied
    /// immediately.
    fn handle_event(self: &Arc<Self>, event: ChangeEvent<K, V>) {
        if event.priming {
            return;
        }
        if matches!(self.state(), CacheState::Configuring | CacheState::Configured) {
            self.deferred.lock().unwrap().insert(event.key.clone());
            return;
        }
        self.deferred.lock().unwrap().remove(&event.key);
        self.apply_transition(&event);
    }

    fn apply_transition(self: &Arc<Self>, event: &ChangeEvent<K, V>) {
        match classify(&self.filter, event) {
            Transition::Entered => {
                self.storage.insert(event.key.clone(), self.store_value(event.new.clone()));
                self.notify_listeners(event.clone());
            }
            Transition::Within => {
                if self.cache_values.load(AtomicOrdering::Acquire) {
                    self.storage.insert(event.key.clone(), self.store_value(event.new.clone()));
                }
                self.notify_listeners(event.clone());
            }
            Transition::Left => {
                if self.storage.remove(&event.key).is_some() {
                    self.stats.invalidations.fetch_add(1, AtomicOrdering::Relaxed);
                    self.notify_listeners(event.clone());
                }
            }
            Transition::Ignore => {}
        }
    }

    fn notify_listeners(self: &Arc<Self>, event: ChangeEvent<K, V>) {
        for entry in self.listeners.iter() {
            let registration = entry.value();
            let interested = registration
                .filter
                .as_ref()
                .map(|f| f.evaluate(&event.key, event.new.as_ref()))
                .unwrap_or(true);
            if !interested {
                continue;
            }
            let delivered = if registration.lite { strip_old_value(event.clone()) } else { event.clone() };
            if registration.synchronous {
                (registration.callback)(delivered);
            } else {
                self.dispatcher.dispatch(delivered, registration.callback.clone());
            }
        }
    }

    /// The (re)configuration sequence, run under
    /// `reconfigure_lock` so concurrent callers never race two
    /// registrations. A caller that finds the view already `Synchronized`
    /// by the time it acquires the lock just returns — someone else beat
    /// it to reconfiguring.
    async fn reconfigure(self: &Arc<Self>) -> Result<(), CacheError> {
        let _guard = self.reconfigure_lock.lock().await;
        if self.state() == CacheState::Synchronized {
            return Ok(());
        }

        // Step 1: allocate a fresh DeferredEventSet, enter Configuring.
        self.deferred.lock().unwrap().clear();
        self.set_state(CacheState::Configuring);

        // Steps 2-4: register the add/remove listener over the view's
        // filter. A single subscription suffices here — `apply_transition`
        // derives Entered/Left/Within locally (see `classify`) rather than
        // relying on the back to split it into two differently-masked
        // subscriptions, since `coherent-mock`'s filter matching is a plain
        // predicate evaluator, not a mask-aware one.
        if let Some(old_sub) = self.view_subscription.lock().unwrap().take() {
            let _ = self.back.unsubscribe(old_sub).await;
        }
        let (sink, mut source) = mpsc::unbounded_channel();
        trace!(
            add = describe_role(ListenerRole::AddToView),
            remove = describe_role(ListenerRole::RemoveFromView),
            "establishing merged view subscription"
        );
        let event_filter: BoxFilter<K, V> = Arc::new(EventFilter::new(VIEW_EVENT_MASK, self.filter.clone()));
        let subscribe_result =
            self.back.subscribe(SubscriptionTarget::Filter(event_filter), SubscriptionMode::Standard, sink).await;
        let sub_id = match subscribe_result {
            Ok(id) => id,
            Err(err) => {
                self.set_state(CacheState::Disconnected);
                return Err(err.into());
            }
        };
        *self.view_subscription.lock().unwrap() = Some(sub_id);

        let routed = self.clone();
        tokio::spawn(async move {
            while let Some(event) = source.recv().await {
                routed.handle_event(event);
            }
        });

        // Step 5: bulk-load initial contents, reconciling with whatever
        // the view already held (retain members still in the result set,
        // insert the rest).
        let entries = self.back.query(&self.filter).await?;
        let fresh_keys: HashSet<K> = entries.iter().map(|(k, _)| k.clone()).collect();
        self.storage.retain(|k, _| fresh_keys.contains(k));
        for (key, value) in entries {
            let stored = self.store_value(Some(value));
            self.storage.insert(key, stored);
        }

        // Step 6: Configured. A concurrent deactivation may have already
        // driven the FSM to Disconnected while steps 2-5 were in flight;
        // surface that instead of silently overwriting it.
        expect_state(self.state(), CacheState::Configuring)?;
        self.set_state(CacheState::Configured);

        // Step 7: drain the DeferredEventSet, re-reading each key from the
        // back. Looping until the set is dry (rather than draining once)
        // covers events that arrive during the drain itself — they are
        // still recorded as deferred by `handle_event` since state is
        // still `Configured`, and must be reconciled before advancing.
        loop {
            let batch: Vec<K> = { self.deferred.lock().unwrap().drain().collect() };
            if batch.is_empty() {
                break;
            }
            for key in batch {
                let value = self.back.get(&key).await?;
                if self.filter.evaluate(&key, value.as_ref()) {
                    let stored = self.store_value(value);
                    self.storage.insert(key, stored);
                } else {
                    self.storage.remove(&key);
                }
            }
        }

        // Step 8: Synchronized. Same race guard as step 6.
        expect_state(self.state(), CacheState::Configured)?;
        self.set_state(CacheState::Synchronized);
        self.sync_notify.notify_waiters();
        Ok(())
    }

    fn reconnect_window_active(&self) -> bool {
        if self.reconnect_interval.is_zero() {
            return false;
        }
        match *self.disconnected_at.lock().unwrap() {
            Some(since) => since.elapsed() < self.reconnect_interval,
            None => false,
        }
    }
}

/// A continuously-maintained materialized view over a back cache, filtered
/// by a predicate. Cheaply cloneable; every clone shares the same internal
/// storage, FSM state, and listener registry.
pub struct ContinuousQueryCache<K, V, B> {
    inner: Arc<Inner<K, V, B>>,
    deactivation_task: Arc<JoinHandle<()>>,
}

impl<K, V, B> Clone for ContinuousQueryCache<K, V, B> {
    fn clone(&self) -> Self {
        ContinuousQueryCache { inner: self.inner.clone(), deactivation_task: self.deactivation_task.clone() }
    }
}

impl<K, V, B> ContinuousQueryCache<K, V, B>
where
    K: Eq + Hash + Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + Send + Sync + 'static,
{
    /// Builds a view over `back` and synchronously drives it all the way
    /// to `Synchronized` before returning — construction is not "a use
    /// while disconnected", so `ReconnectInterval` plays no part here.
    pub async fn new(back: B, config: CqcConfig<K, V>) -> Result<Self, CacheError> {
        if config.transformer.is_some() && !config.cache_values {
            return Err(CacheError::ArgumentInvalid(
                "a ContinuousQueryCache transformer requires cache_values to be enabled",
            ));
        }
        let back = Arc::new(back);
        let read_only = config.transformer.is_some();
        let inner = Arc::new(Inner {
            back: back.clone(),
            filter: config.filter,
            cache_values: AtomicBool::new(config.cache_values),
            read_only: AtomicBool::new(read_only),
            transformer: config.transformer,
            reconnect_interval: config.reconnect_interval,
            state: RwLock::new(CacheState::Disconnected),
            disconnected_at: Mutex::new(None),
            deferred: Mutex::new(HashSet::new()),
            storage: DashMap::new(),
            dispatcher: EventDispatcher::new(),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            indexes: DashMap::new(),
            next_index_id: AtomicU64::new(0),
            view_subscription: Mutex::new(None),
            reconfigure_lock: tokio::sync::Mutex::new(()),
            sync_notify: Notify::new(),
            stats: Stats::new(),
        });

        let on_deleted = inner.clone();
        let on_truncated = inner.clone();
        let deactivation_task = spawn_deactivation_listener(
            back.deactivation_channel(),
            move || {
                let inner = on_deleted.clone();
                async move {
                    *inner.disconnected_at.lock().unwrap() = Some(Instant::now());
                    inner.set_state(CacheState::Disconnected);
                }
            },
            move || {
                let inner = on_truncated.clone();
                async move {
                    inner.storage.clear();
                }
            },
        );

        inner.reconfigure().await?;
        Ok(ContinuousQueryCache { inner, deactivation_task: Arc::new(deactivation_task) })
    }

    /// Ensures the view is usable for the call about to happen, per
    /// `ReconnectInterval`'s semantics: `Synchronized` proceeds
    /// immediately; a fresh `Disconnected` state either serves local,
    /// possibly-stale reads (within the window) or triggers
    /// reconfiguration (past it, or immediately if the window is zero).
    async fn ensure_synchronized(&self) -> Result<(), CacheError> {
        loop {
            let notified = self.inner.sync_notify.notified();
            match self.inner.state() {
                CacheState::Synchronized => return Ok(()),
                CacheState::Disconnected => {
                    if self.inner.reconnect_window_active() {
                        return Ok(());
                    }
                    if self.inner.reconnect_interval.is_zero() {
                        return Err(CacheError::Inactive);
                    }
                    self.inner.reconfigure().await?;
                    return Ok(());
                }
                CacheState::Configuring | CacheState::Configured => {
                    notified.await;
                }
            }
        }
    }

    /// Whether this view rejects mutation — set once a transformer is
    /// configured and never cleared back to false.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(AtomicOrdering::Acquire)
    }

    /// Current synchronization state.
    pub fn state(&self) -> CacheState {
        self.inner.state()
    }

    /// Number of keys currently satisfying the view's filter.
    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    /// Whether the view currently has no members.
    pub fn is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    /// Raw hit/miss/invalidation counters (see [`CacheStatistics`]).
    pub fn stats(&self) -> CacheStatistics {
        self.inner.stats.snapshot()
    }

    /// Whether `key` currently satisfies the view's filter.
    #[instrument(skip(self), level = "trace")]
    pub async fn contains(&self, key: &K) -> Result<bool, CacheError> {
        self.ensure_synchronized().await?;
        Ok(self.inner.storage.contains_key(key))
    }

    /// Reads a single member's value.
    #[instrument(skip(self), level = "trace")]
    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.ensure_synchronized().await?;
        if self.inner.cache_values.load(AtomicOrdering::Acquire) {
            let hit = self.inner.storage.get(key).and_then(|v| v.clone());
            if hit.is_some() {
                self.inner.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            }
            return Ok(hit);
        }
        if !self.inner.storage.contains_key(key) {
            return Ok(None);
        }
        self.inner.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(self.inner.back.get(key).await?)
    }

    /// Reads several members' values.
    pub async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, CacheError> {
        self.ensure_synchronized().await?;
        if self.inner.cache_values.load(AtomicOrdering::Acquire) {
            return Ok(keys
                .iter()
                .filter_map(|k| self.inner.storage.get(k).and_then(|v| v.clone()).map(|v| (k.clone(), v)))
                .collect());
        }
        let mut result = self.inner.back.get_all(keys).await?;
        let filter = &self.inner.filter;
        result.retain(|k, v| filter.evaluate(k, Some(v)));
        Ok(result)
    }

    /// Keys satisfying `filter`, merged with the view's own predicate.
    pub async fn get_keys(&self, filter: &BoxFilter<K, V>) -> Result<Vec<K>, CacheError>
    where
        K: PartialEq,
    {
        self.ensure_synchronized().await?;
        let merged = self.inner.merged_filter(filter.clone());
        if self.inner.cache_values.load(AtomicOrdering::Acquire) {
            return Ok(self
                .inner
                .storage
                .iter()
                .filter(|entry| merged.evaluate(entry.key(), entry.value().as_ref()))
                .map(|entry| entry.key().clone())
                .collect());
        }
        Ok(self.inner.back.query(&merged).await?.into_iter().map(|(k, _)| k).collect())
    }

    /// Values satisfying `filter`, merged with the view's own predicate.
    pub async fn get_values(&self, filter: &BoxFilter<K, V>) -> Result<Vec<V>, CacheError>
    where
        K: PartialEq,
    {
        Ok(self.get_entries(filter, None).await?.into_iter().map(|(_, v)| v).collect())
    }

    /// Entries satisfying `filter`, merged with the view's own predicate,
    /// optionally ordered by `comparer`.
    pub async fn get_entries(
        &self,
        filter: &BoxFilter<K, V>,
        comparer: Option<&(dyn Fn(&(K, V), &(K, V)) -> Ordering + Send + Sync)>,
    ) -> Result<Vec<(K, V)>, CacheError>
    where
        K: PartialEq,
    {
        self.ensure_synchronized().await?;
        let merged = self.inner.merged_filter(filter.clone());
        let mut entries: Vec<(K, V)> = if self.inner.cache_values.load(AtomicOrdering::Acquire) {
            self.inner
                .storage
                .iter()
                .filter_map(|entry| {
                    entry
                        .value()
                        .clone()
                        .filter(|v| merged.evaluate(entry.key(), Some(v)))
                        .map(|v| (entry.key().clone(), v))
                })
                .collect()
        } else {
            self.inner.back.query(&merged).await?
        };
        if let Some(cmp) = comparer {
            entries.sort_by(cmp);
        }
        Ok(entries)
    }

    /// Writes a single entry through to the back cache, after verifying it
    /// satisfies the view's filter. The view's own local storage is not
    /// updated here — local changes arrive later via the event stream once
    /// the back reports the mutation back through the view's own
    /// subscription.
    #[instrument(skip(self, value), level = "trace")]
    pub async fn insert(&self, key: K, value: V) -> Result<(), CacheError> {
        if self.is_read_only() {
            return Err(CacheError::Unsupported("ContinuousQueryCache is read-only"));
        }
        self.ensure_synchronized().await?;
        if !self.inner.filter.evaluate(&key, Some(&value)) {
            return Err(CacheError::PredicateViolation);
        }
        self.inner.back.insert(key, value).await?;
        Ok(())
    }

    /// Writes several entries, rejecting the whole batch if any entry
    /// fails the view's filter (checked before any write is issued).
    pub async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), CacheError> {
        if self.is_read_only() {
            return Err(CacheError::Unsupported("ContinuousQueryCache is read-only"));
        }
        self.ensure_synchronized().await?;
        for (key, value) in &entries {
            if !self.inner.filter.evaluate(key, Some(value)) {
                return Err(CacheError::PredicateViolation);
            }
        }
        self.inner.back.insert_all(entries).await?;
        Ok(())
    }

    /// Removes a single entry from the back cache.
    pub async fn remove(&self, key: &K) -> Result<(), CacheError> {
        if self.is_read_only() {
            return Err(CacheError::Unsupported("ContinuousQueryCache is read-only"));
        }
        self.ensure_synchronized().await?;
        self.inner.back.remove(key).await?;
        Ok(())
    }

    /// Removes every entry this view currently sees as a member. Unlike
    /// `CompositeCache::clear`, this never touches the back cache's
    /// entries outside the view's filter.
    pub async fn clear(&self) -> Result<(), CacheError> {
        if self.is_read_only() {
            return Err(CacheError::Unsupported("ContinuousQueryCache is read-only"));
        }
        self.ensure_synchronized().await?;
        let keys: Vec<K> = self.inner.storage.iter().map(|entry| entry.key().clone()).collect();
        let back = &self.inner.back;
        let outcomes = join_all(keys.iter().map(|key| back.remove(key))).await;
        for (key, outcome) in keys.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(?key, ?err, "failed to remove entry during ContinuousQueryCache::clear");
            }
        }
        Ok(())
    }

    /// Runs an entry processor against a single key, after verifying it is
    /// either a view member or genuinely absent remotely — a key that
    /// exists remotely but falls outside the view fails with `OutOfView`
    /// rather than silently operating on it.
    pub async fn invoke(
        &self,
        key: &K,
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Box<dyn std::any::Any + Send>, CacheError> {
        self.ensure_synchronized().await?;
        self.ensure_in_view_or_absent(key).await?;
        Ok(self.inner.back.invoke(key, processor).await?)
    }

    /// Runs an entry processor against several keys, failing the whole
    /// call if any key exists remotely but outside the view.
    pub async fn invoke_all(
        &self,
        keys: &[K],
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Vec<Box<dyn std::any::Any + Send>>, CacheError> {
        self.ensure_synchronized().await?;
        for key in keys {
            self.ensure_in_view_or_absent(key).await?;
        }
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.inner.back.invoke(key, processor).await?);
        }
        Ok(results)
    }

    async fn ensure_in_view_or_absent(&self, key: &K) -> Result<(), CacheError> {
        if self.inner.storage.contains_key(key) {
            return Ok(());
        }
        if self.inner.back.get(key).await?.is_some() {
            return Err(CacheError::OutOfView);
        }
        Ok(())
    }

    /// Aggregates over entries satisfying `filter`, merged with the
    /// view's own predicate, delegating execution to the back cache.
    pub async fn aggregate(
        &self,
        filter: &BoxFilter<K, V>,
        aggregator: &(dyn Aggregator<K, V>),
    ) -> Result<Box<dyn std::any::Any + Send>, CacheError>
    where
        K: PartialEq,
    {
        self.ensure_synchronized().await?;
        let merged = self.inner.merged_filter(filter.clone());
        Ok(self.inner.back.aggregate(&merged, aggregator).await?)
    }

    /// Registers a query-acceleration index. Always forwarded to the back
    /// cache; kept as a local bookkeeping entry only when `cache_values`
    /// is set. Presence or absence of the local entry never changes query
    /// results — only their cost — so no query path above actually
    /// consults `indexes`.
    pub async fn add_index(
        &self,
        extractor: &(dyn ValueExtractor<K, V>),
        ordered: bool,
    ) -> Result<IndexId, CacheError> {
        self.inner.back.add_index(extractor, ordered).await?;
        let id = IndexId(self.inner.next_index_id.fetch_add(1, AtomicOrdering::Relaxed));
        if self.inner.cache_values.load(AtomicOrdering::Acquire) {
            self.inner.indexes.insert(id, ());
        }
        Ok(id)
    }

    /// Removes a locally-registered index. Deliberately **not** forwarded
    /// to the back cache — removing a shared remote index would affect
    /// other clients querying the same back cache.
    pub fn remove_index(&self, id: IndexId) {
        self.inner.indexes.remove(&id);
    }

    /// Registers a callback fired whenever a member event matching
    /// `options.filter` occurs. If the listener needs old values (non-lite)
    /// or supplies a filter, `cache_values` is forced on for this view and
    /// a reconfiguration is kicked off in the background to backfill
    /// values for existing members.
    pub fn add_cache_listener(&self, callback: ListenerFn<K, V>, options: CacheListenerOptions<K, V>) -> ListenerId
    where
        K: PartialEq,
    {
        let needs_values = !options.lite || options.filter.is_some();
        if needs_values && !self.inner.cache_values.swap(true, AtomicOrdering::AcqRel) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(err) = inner.reconfigure().await {
                    warn!(?err, "failed to backfill values after enabling cache_values for a listener");
                }
            });
        }
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, AtomicOrdering::Relaxed));
        self.inner.listeners.insert(
            id,
            ListenerRegistration { callback, filter: options.filter, lite: options.lite, synchronous: options.synchronous },
        );
        id
    }

    /// Deregisters a previously added listener. A no-op if it is already
    /// gone.
    pub fn remove_cache_listener(&self, id: ListenerId) {
        self.inner.listeners.remove(&id);
    }
}

impl<K, V, B> Drop for ContinuousQueryCache<K, V, B> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.deactivation_task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_core::filter::{Filter, Neutral};
    use coherent_mock::MockBackCache;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::time::Duration;

    struct StartsWithEither(char, char);

    impl Filter<u32, String> for StartsWithEither {
        fn evaluate(&self, _key: &u32, value: Option<&String>) -> bool {
            value.is_some_and(|v| v.starts_with(self.0) || v.starts_with(self.1))
        }
    }

    async fn populated_back() -> MockBackCache<u32, String> {
        let back = MockBackCache::new();
        back.insert(1, "apple".to_string()).await.unwrap();
        back.insert(2, "banana".to_string()).await.unwrap();
        back.insert(3, "cherry".to_string()).await.unwrap();
        back
    }

    #[tokio::test]
    async fn initial_population_reaches_synchronized() {
        let back = populated_back().await;
        let filter: BoxFilter<u32, String> = Arc::new(StartsWithEither('b', 'c'));
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back, config).await.unwrap();

        assert_eq!(cqc.state(), CacheState::Synchronized);
        assert_eq!(cqc.len(), 2);
        assert!(cqc.contains(&2).await.unwrap());
        assert!(cqc.contains(&3).await.unwrap());
        assert!(!cqc.contains(&1).await.unwrap());
    }

    #[tokio::test]
    async fn insert_entering_and_leaving_the_view_converge_via_events() {
        let back = Arc::new(populated_back().await);
        let filter: BoxFilter<u32, String> = Arc::new(StartsWithEither('b', 'c'));
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back.clone(), config).await.unwrap();
        assert_eq!(cqc.len(), 2);

        back.insert(4, "date".to_string()).await.unwrap();
        for _ in 0..50 {
            if cqc.contains(&4).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cqc.get(&4).await.unwrap(), Some("date".to_string()));

        back.insert(2, "avocado".to_string()).await.unwrap();
        for _ in 0..50 {
            if !cqc.contains(&2).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!cqc.contains(&2).await.unwrap());
        assert!(cqc.contains(&3).await.unwrap());
        assert!(cqc.contains(&4).await.unwrap());
    }

    #[tokio::test]
    async fn write_violating_filter_is_rejected() {
        let back = populated_back().await;
        let filter: BoxFilter<u32, String> = Arc::new(StartsWithEither('b', 'c'));
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back, config).await.unwrap();

        let result = cqc.insert(9, "date".to_string()).await;
        assert!(matches!(result, Err(CacheError::PredicateViolation)));
    }

    #[tokio::test]
    async fn transformer_forces_read_only_and_is_applied_to_stored_values() {
        let back = populated_back().await;
        let filter: BoxFilter<u32, String> = Arc::new(Neutral);
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: Some(coherent_core::BoxTransformer::new(|s: String| s.to_uppercase())),
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back, config).await.unwrap();

        assert!(cqc.is_read_only());
        assert_eq!(cqc.get(&1).await.unwrap(), Some("APPLE".to_string()));

        let result = cqc.insert(9, "fig".to_string()).await;
        assert!(matches!(result, Err(CacheError::Unsupported(_))));
    }

    #[tokio::test]
    async fn transformer_without_cache_values_is_rejected() {
        let back = populated_back().await;
        let filter: BoxFilter<u32, String> = Arc::new(Neutral);
        let config = CqcConfig {
            filter,
            cache_values: false,
            transformer: Some(coherent_core::BoxTransformer::new(|s: String| s.to_uppercase())),
            reconnect_interval: Duration::from_secs(5),
        };
        let result = ContinuousQueryCache::new(back, config).await;

        assert!(matches!(result, Err(CacheError::ArgumentInvalid(_))));
    }

    #[test]
    fn expect_state_matches_returns_ok() {
        assert!(expect_state(CacheState::Configured, CacheState::Configured).is_ok());
    }

    #[test]
    fn expect_state_mismatch_surfaces_the_actual_state() {
        let result = expect_state(CacheState::Disconnected, CacheState::Configured);
        match result {
            Err(CacheError::InvalidStateTransition { from }) => assert_eq!(from, CacheState::Disconnected),
            other => panic!("expected InvalidStateTransition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_view_invoke_is_rejected() {
        struct NoOp;
        impl EntryProcessor<u32, String> for NoOp {
            fn process(
                &self,
                _key: &u32,
                current: Option<&String>,
            ) -> (Box<dyn std::any::Any + Send>, Option<Option<String>>) {
                (Box::new(current.is_some()), None)
            }
        }

        let back = populated_back().await;
        let filter: BoxFilter<u32, String> = Arc::new(StartsWithEither('b', 'c'));
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back, config).await.unwrap();

        let result = cqc.invoke(&1, &NoOp).await;
        assert!(matches!(result, Err(CacheError::OutOfView)));
    }

    #[tokio::test]
    async fn remove_index_is_never_forwarded_to_the_back() {
        let back = populated_back().await;
        let filter: BoxFilter<u32, String> = Arc::new(Neutral);
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back, config).await.unwrap();

        struct LengthExtractor;
        impl ValueExtractor<u32, String> for LengthExtractor {
            fn extract(&self, _key: &u32, value: &String) -> Box<dyn std::any::Any + Send> {
                Box::new(value.len())
            }
        }
        let _ = StringLength;

        let id = cqc.add_index(&LengthExtractor, false).await.unwrap();
        cqc.remove_index(id);
        // There is no back-facing remove_index call to assert against —
        // the asymmetry is structural: `BackCache` has no such method.
    }

    #[tokio::test]
    async fn reconnect_window_serves_stale_then_triggers_reconfigure() {
        let back = Arc::new(populated_back().await);
        let filter: BoxFilter<u32, String> = Arc::new(StartsWithEither('b', 'c'));
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_millis(200),
        };
        let cqc = ContinuousQueryCache::new(back.clone(), config).await.unwrap();
        assert_eq!(cqc.state(), CacheState::Synchronized);

        back.clear().await.unwrap();
        for _ in 0..50 {
            if cqc.state() == CacheState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cqc.state(), CacheState::Disconnected);

        // Within the reconnect window: served from (now-stale) storage,
        // no reconfiguration triggered.
        assert!(cqc.contains(&2).await.unwrap());
        assert_eq!(cqc.state(), CacheState::Disconnected);
    }

    #[tokio::test]
    async fn synchronous_listener_fires_inline() {
        let back = Arc::new(populated_back().await);
        let filter: BoxFilter<u32, String> = Arc::new(StartsWithEither('b', 'c'));
        let config = CqcConfig {
            filter,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
        };
        let cqc = ContinuousQueryCache::new(back.clone(), config).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        cqc.add_cache_listener(
            Arc::new(move |_event| {
                seen_clone.fetch_add(1, StdOrdering::SeqCst);
            }),
            CacheListenerOptions { filter: None, lite: true, synchronous: true },
        );

        back.insert(5, "coconut".to_string()).await.unwrap();
        for _ in 0..50 {
            if seen.load(StdOrdering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(StdOrdering::SeqCst), 1);
    }
}
