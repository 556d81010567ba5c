//! An in-process `BackCache`, the workspace's only concrete back cache.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use coherent_backend::backend::{Aggregator, BackCache, EntryProcessor, ValueExtractor};
use coherent_backend::error::BackendError;
use coherent_backend::subscription::{
    DeactivationEvent, SubscriptionId, SubscriptionMode, SubscriptionTarget,
};
use coherent_core::event::ChangeEvent;
use coherent_core::filter::{BoxFilter, Filter};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

struct Subscriber<K, V> {
    target: SubscriptionTarget<K, V>,
    mode: SubscriptionMode,
    sink: mpsc::UnboundedSender<ChangeEvent<K, V>>,
}

impl<K, V> Subscriber<K, V>
where
    K: Eq + Send + Sync,
    V: Send + Sync,
{
    /// A filter subscription matches if *either* the old or the new value
    /// satisfies it — a real back cache does the same, since a listener
    /// interested in entries leaving a filter's membership needs the event
    /// even though the new value itself no longer matches.
    fn matches(&self, key: &K, old: Option<&V>, new: Option<&V>) -> bool {
        match &self.target {
            SubscriptionTarget::Key(target_key) => target_key == key,
            SubscriptionTarget::Filter(filter) => filter.evaluate(key, old) || filter.evaluate(key, new),
            SubscriptionTarget::All => true,
        }
    }

    fn deliver(&self, mut event: ChangeEvent<K, V>)
    where
        K: Clone,
        V: Clone,
    {
        if self.mode == SubscriptionMode::Lite {
            event.old = None;
        }
        // A disconnected receiver just means the subscriber dropped its
        // side without unsubscribing; best-effort delivery, nothing to do.
        let _ = self.sink.send(event);
    }
}

/// A `DashMap`-backed, subscription-capable in-memory key/value store.
///
/// Every [`BackCache`] mutation is reported to matching subscribers
/// synchronously, before the mutating call returns — there is no
/// background ingest thread here, because there is nothing to decouple
/// from (no real network round trip). Callers exercising reconnect/replay
/// behavior should expect "external" writes to be visible to subscribers
/// immediately.
pub struct MockBackCache<K, V> {
    store: DashMap<K, V>,
    subscribers: DashMap<SubscriptionId, Subscriber<K, V>>,
    next_subscription_id: AtomicU64,
    deactivation: broadcast::Sender<DeactivationEvent>,
    deleted: AtomicBool,
    index_count: AtomicU64,
}

impl<K, V> Default for MockBackCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MockBackCache<K, V>
where
    K: Eq + Hash,
{
    /// Builds an empty back cache.
    pub fn new() -> Self {
        let (deactivation, _) = broadcast::channel(16);
        MockBackCache {
            store: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription_id: AtomicU64::new(0),
            deactivation,
            deleted: AtomicBool::new(false),
            index_count: AtomicU64::new(0),
        }
    }

    /// Number of indexes currently registered, for test assertions.
    pub fn index_count(&self) -> u64 {
        self.index_count.load(Ordering::Relaxed)
    }

    fn ensure_live(&self) -> Result<(), BackendError> {
        if self.deleted.load(Ordering::Acquire) {
            Err(BackendError::Unsupported(
                "back cache was deleted; construct a new MockBackCache",
            ))
        } else {
            Ok(())
        }
    }

    fn fan_out(&self, event: &ChangeEvent<K, V>)
    where
        K: Clone,
        V: Clone,
    {
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.matches(&event.key, event.old.as_ref(), event.new.as_ref()) {
                subscriber.deliver(event.clone());
            }
        }
    }

    /// Number of entries currently stored. Exposed for the same reason
    /// `hitbox_moka::MokaBackend::entry_count` is: capacity-aware test
    /// assertions.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Test-facing alias for [`BackCache::insert`], named for what it
    /// simulates: a write made by something other than the cache under
    /// test, arriving concurrently.
    pub async fn external_insert(&self, key: K, value: V) -> Result<(), BackendError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.insert(key, value).await
    }

    /// Test-facing alias for [`BackCache::remove`].
    pub async fn external_remove(&self, key: &K) -> Result<(), BackendError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.remove(key).await
    }
}

#[async_trait]
impl<K, V> BackCache<K, V> for MockBackCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, BackendError> {
        self.ensure_live()?;
        Ok(self.store.get(key).map(|entry| entry.value().clone()))
    }

    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, BackendError> {
        self.ensure_live()?;
        Ok(keys
            .iter()
            .filter_map(|key| self.store.get(key).map(|entry| (key.clone(), entry.value().clone())))
            .collect())
    }

    async fn insert(&self, key: K, value: V) -> Result<(), BackendError> {
        self.ensure_live()?;
        let old = self.store.insert(key.clone(), value.clone());
        let event = match &old {
            Some(old_value) => {
                ChangeEvent::new(coherent_core::EventKind::Updated, key, Some(old_value.clone()), Some(value))
            }
            None => ChangeEvent::new(coherent_core::EventKind::Inserted, key, None, Some(value)),
        };
        trace!(key = ?event.key, kind = ?event.kind, "mock back cache insert");
        self.fan_out(&event);
        Ok(())
    }

    async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), BackendError> {
        for (key, value) in entries {
            self.insert(key, value).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<(), BackendError> {
        self.ensure_live()?;
        if let Some((_, old_value)) = self.store.remove(key) {
            let event = ChangeEvent::new(coherent_core::EventKind::Deleted, key.clone(), Some(old_value), None);
            trace!(key = ?event.key, "mock back cache remove");
            self.fan_out(&event);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.ensure_live()?;
        self.store.clear();
        self.deleted.store(true, Ordering::Release);
        let _ = self.deactivation.send(DeactivationEvent::Deleted);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), BackendError> {
        self.ensure_live()?;
        self.store.clear();
        let _ = self.deactivation.send(DeactivationEvent::Truncated);
        Ok(())
    }

    async fn query(&self, filter: &BoxFilter<K, V>) -> Result<Vec<(K, V)>, BackendError> {
        self.ensure_live()?;
        Ok(self
            .store
            .iter()
            .filter(|entry| filter.evaluate(entry.key(), Some(entry.value())))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn invoke(
        &self,
        key: &K,
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        self.ensure_live()?;
        let current = self.store.get(key).map(|entry| entry.value().clone());
        let (result, mutation) = processor.process(key, current.as_ref());
        if let Some(new_value) = mutation {
            match new_value {
                Some(value) => {
                    self.insert(key.clone(), value).await?;
                }
                None => {
                    self.remove(key).await?;
                }
            }
        }
        Ok(result)
    }

    async fn aggregate(
        &self,
        filter: &BoxFilter<K, V>,
        aggregator: &(dyn Aggregator<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        let entries = self.query(filter).await?;
        Ok(aggregator.aggregate(&entries))
    }

    async fn add_index(
        &self,
        _extractor: &(dyn ValueExtractor<K, V>),
        _ordered: bool,
    ) -> Result<(), BackendError> {
        self.ensure_live()?;
        // Nothing to accelerate in a DashMap scan; just record that one
        // was asked for, so tests can assert the core actually forwarded
        // the registration.
        self.index_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(
        &self,
        target: SubscriptionTarget<K, V>,
        mode: SubscriptionMode,
        sink: mpsc::UnboundedSender<ChangeEvent<K, V>>,
    ) -> Result<SubscriptionId, BackendError> {
        self.ensure_live()?;
        let id = SubscriptionId::new(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));

        let priming_events: Vec<ChangeEvent<K, V>> = match &target {
            SubscriptionTarget::Key(key) => {
                let value = self.store.get(key).map(|entry| entry.value().clone());
                vec![ChangeEvent::priming(key.clone(), value)]
            }
            SubscriptionTarget::Filter(filter) => self
                .store
                .iter()
                .filter(|entry| filter.evaluate(entry.key(), Some(entry.value())))
                .map(|entry| ChangeEvent::priming(entry.key().clone(), Some(entry.value().clone())))
                .collect(),
            SubscriptionTarget::All => self
                .store
                .iter()
                .map(|entry| ChangeEvent::priming(entry.key().clone(), Some(entry.value().clone())))
                .collect(),
        };

        let subscriber = Subscriber { target, mode, sink };
        for event in priming_events {
            subscriber.deliver(event);
        }
        self.subscribers.insert(id, subscriber);
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        self.subscribers.remove(&id);
        Ok(())
    }

    fn deactivation_channel(&self) -> broadcast::Receiver<DeactivationEvent> {
        self.deactivation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_backend::subscription::SubscriptionMode;
    use coherent_core::filter::Neutral;
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let back: MockBackCache<&str, i32> = MockBackCache::new();
        back.insert("a", 1).await.unwrap();
        assert_eq!(back.get(&"a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn key_subscription_gets_priming_then_update() {
        let back: MockBackCache<&str, i32> = MockBackCache::new();
        back.insert("a", 1).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        back.subscribe(SubscriptionTarget::Key("a"), SubscriptionMode::Standard, tx)
            .await
            .unwrap();

        let priming = rx.recv().await.unwrap();
        assert!(priming.priming);
        assert_eq!(priming.new, Some(1));

        back.insert("a", 2).await.unwrap();
        let update = rx.recv().await.unwrap();
        assert!(!update.priming);
        assert_eq!(update.old, Some(1));
        assert_eq!(update.new, Some(2));
    }

    #[tokio::test]
    async fn filter_subscription_only_matches_matching_keys() {
        let back: MockBackCache<&str, i32> = MockBackCache::new();
        back.insert("a", 1).await.unwrap();
        back.insert("b", 2).await.unwrap();

        let filter: BoxFilter<&str, i32> = Arc::new(Neutral);
        let (tx, mut rx) = mpsc::unbounded_channel();
        back.subscribe(SubscriptionTarget::Filter(filter), SubscriptionMode::Standard, tx)
            .await
            .unwrap();

        let mut primed = vec![rx.recv().await.unwrap().key, rx.recv().await.unwrap().key];
        primed.sort();
        assert_eq!(primed, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn clear_broadcasts_deleted_and_locks_out_further_calls() {
        let back: MockBackCache<&str, i32> = MockBackCache::new();
        let mut deactivation = back.deactivation_channel();
        back.insert("a", 1).await.unwrap();
        back.clear().await.unwrap();

        assert_eq!(deactivation.recv().await.unwrap(), DeactivationEvent::Deleted);
        assert!(back.get(&"a").await.is_err());
    }

    #[tokio::test]
    async fn truncate_clears_entries_but_stays_usable() {
        let back: MockBackCache<&str, i32> = MockBackCache::new();
        let mut deactivation = back.deactivation_channel();
        back.insert("a", 1).await.unwrap();
        back.truncate().await.unwrap();

        assert_eq!(deactivation.recv().await.unwrap(), DeactivationEvent::Truncated);
        assert_eq!(back.get(&"a").await.unwrap(), None);
        back.insert("b", 2).await.unwrap();
        assert_eq!(back.get(&"b").await.unwrap(), Some(2));
    }
}
