//! The `BackCache` trait.
//!
//! Grounded on `hitbox-backend::backend::Backend`'s shape: a dyn-compatible
//! async trait (`#[async_trait]`) with blanket implementations forwarding
//! through `&B`, `Box<dyn BackCache<..>>`, and
//! `Arc<dyn BackCache<..> + Send + Sync>`, so callers can hold a back cache
//! behind whichever pointer type is convenient without losing the trait.

use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use coherent_core::event::ChangeEvent;
use coherent_core::filter::BoxFilter;
use tokio::sync::{broadcast, mpsc};

use crate::error::BackendError;
use crate::subscription::{DeactivationEvent, SubscriptionId, SubscriptionMode, SubscriptionTarget};

/// Applies an in-place operation to a single entry and returns an arbitrary
/// result, optionally replacing the entry's value.
///
/// Modeled after a remote-store entry processor: the back cache, not the
/// caller, executes `process` against its authoritative copy of the entry,
/// so the operation is atomic with respect to concurrent writers the caller
/// cannot otherwise observe.
pub trait EntryProcessor<K, V>: Send + Sync {
    /// Processes the current value (`None` if the key is absent), returning
    /// the processor's result and the entry's new value (`None` to leave
    /// the entry unchanged, `Some(None)` to remove it).
    fn process(&self, key: &K, current: Option<&V>) -> (Box<dyn Any + Send>, Option<Option<V>>);
}

/// Reduces every entry matching a filter to a single result.
pub trait Aggregator<K, V>: Send + Sync {
    /// Aggregates over the given entries.
    fn aggregate(&self, entries: &[(K, V)]) -> Box<dyn Any + Send>;
}

/// Projects an entry into the ordering/grouping key a remote index sorts
/// by. The core never inspects what `extract` returns — query filter
/// algebra and value extractors are an out-of-scope external collaborator,
/// exactly like [`EntryProcessor`] and [`Aggregator`] above; this trait
/// only exists so [`BackCache::add_index`] has something to pass through.
pub trait ValueExtractor<K, V>: Send + Sync {
    /// Extracts the ordering/grouping key for one entry.
    fn extract(&self, key: &K, value: &V) -> Box<dyn Any + Send>;
}

/// The remote key/value store a coherent cache keeps itself consistent
/// with.
///
/// Every mutating operation is expected to be reflected on the
/// subscription channel established via [`BackCache::subscribe`] — callers
/// rely on this to invalidate or update their local view instead of
/// re-querying after every write. Wire format and transport are entirely
/// up to the implementation; this trait only describes the operations
/// `coherent-cache` needs.
#[async_trait]
pub trait BackCache<K, V>: Send + Sync
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Reads a single entry.
    async fn get(&self, key: &K) -> Result<Option<V>, BackendError>;

    /// Reads several entries at once. Keys absent from the back cache are
    /// simply absent from the result map.
    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, BackendError>;

    /// Writes a single entry.
    async fn insert(&self, key: K, value: V) -> Result<(), BackendError>;

    /// Writes several entries. Not required to be atomic across keys
    /// (multi-key atomicity is out of scope).
    async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), BackendError>;

    /// Removes a single entry. A no-op, not an error, if the key is absent.
    async fn remove(&self, key: &K) -> Result<(), BackendError>;

    /// Removes every entry, destroying the back cache itself. Subscribers
    /// receive [`DeactivationEvent::Deleted`].
    async fn clear(&self) -> Result<(), BackendError>;

    /// Removes every entry without destroying the back cache. Subscribers
    /// receive [`DeactivationEvent::Truncated`].
    async fn truncate(&self) -> Result<(), BackendError>;

    /// Returns every entry currently satisfying `filter`.
    async fn query(&self, filter: &BoxFilter<K, V>) -> Result<Vec<(K, V)>, BackendError>;

    /// Runs an entry processor against a single key's entry.
    async fn invoke(
        &self,
        key: &K,
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError>;

    /// Runs an aggregator over every entry satisfying `filter`.
    async fn aggregate(
        &self,
        filter: &BoxFilter<K, V>,
        aggregator: &(dyn Aggregator<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError>;

    /// Registers a query-acceleration index with the back cache.
    /// The back is always asked to add an index, whether or not the
    /// caller's own view keeps a local copy of it — other clients querying
    /// the same back cache benefit too. There is a deliberate asymmetry:
    /// no `remove_index` exists on this trait at all, since removing a
    /// shared remote index would affect other clients (see
    /// `coherent-cache::cqc::ContinuousQueryCache::remove_index`, which is
    /// local-only by construction).
    async fn add_index(
        &self,
        extractor: &(dyn ValueExtractor<K, V>),
        ordered: bool,
    ) -> Result<(), BackendError>;

    /// Registers a listener against `target`. Every matching mutation,
    /// including the single synthetic priming event carrying the matched
    /// keys' current values, is sent on `sink`.
    async fn subscribe(
        &self,
        target: SubscriptionTarget<K, V>,
        mode: SubscriptionMode,
        sink: mpsc::UnboundedSender<ChangeEvent<K, V>>,
    ) -> Result<SubscriptionId, BackendError>;

    /// Removes a previously registered subscription. A no-op if it no
    /// longer exists.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError>;

    /// Subscribes to this back cache's deactivation channel (`clear`/
    /// `truncate`). Every caller gets its own receiver; deactivation is
    /// broadcast, not drained by the first listener.
    fn deactivation_channel(&self) -> broadcast::Receiver<DeactivationEvent>;
}

#[async_trait]
impl<K, V, B> BackCache<K, V> for &B
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + ?Sized,
{
    async fn get(&self, key: &K) -> Result<Option<V>, BackendError> {
        (**self).get(key).await
    }

    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, BackendError> {
        (**self).get_all(keys).await
    }

    async fn insert(&self, key: K, value: V) -> Result<(), BackendError> {
        (**self).insert(key, value).await
    }

    async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), BackendError> {
        (**self).insert_all(entries).await
    }

    async fn remove(&self, key: &K) -> Result<(), BackendError> {
        (**self).remove(key).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        (**self).clear().await
    }

    async fn truncate(&self) -> Result<(), BackendError> {
        (**self).truncate().await
    }

    async fn query(&self, filter: &BoxFilter<K, V>) -> Result<Vec<(K, V)>, BackendError> {
        (**self).query(filter).await
    }

    async fn invoke(
        &self,
        key: &K,
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        (**self).invoke(key, processor).await
    }

    async fn aggregate(
        &self,
        filter: &BoxFilter<K, V>,
        aggregator: &(dyn Aggregator<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        (**self).aggregate(filter, aggregator).await
    }

    async fn add_index(
        &self,
        extractor: &(dyn ValueExtractor<K, V>),
        ordered: bool,
    ) -> Result<(), BackendError> {
        (**self).add_index(extractor, ordered).await
    }

    async fn subscribe(
        &self,
        target: SubscriptionTarget<K, V>,
        mode: SubscriptionMode,
        sink: mpsc::UnboundedSender<ChangeEvent<K, V>>,
    ) -> Result<SubscriptionId, BackendError> {
        (**self).subscribe(target, mode, sink).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        (**self).unsubscribe(id).await
    }

    fn deactivation_channel(&self) -> broadcast::Receiver<DeactivationEvent> {
        (**self).deactivation_channel()
    }
}

#[async_trait]
impl<K, V, B> BackCache<K, V> for Box<B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + ?Sized,
{
    async fn get(&self, key: &K) -> Result<Option<V>, BackendError> {
        (**self).get(key).await
    }

    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, BackendError> {
        (**self).get_all(keys).await
    }

    async fn insert(&self, key: K, value: V) -> Result<(), BackendError> {
        (**self).insert(key, value).await
    }

    async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), BackendError> {
        (**self).insert_all(entries).await
    }

    async fn remove(&self, key: &K) -> Result<(), BackendError> {
        (**self).remove(key).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        (**self).clear().await
    }

    async fn truncate(&self) -> Result<(), BackendError> {
        (**self).truncate().await
    }

    async fn query(&self, filter: &BoxFilter<K, V>) -> Result<Vec<(K, V)>, BackendError> {
        (**self).query(filter).await
    }

    async fn invoke(
        &self,
        key: &K,
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        (**self).invoke(key, processor).await
    }

    async fn aggregate(
        &self,
        filter: &BoxFilter<K, V>,
        aggregator: &(dyn Aggregator<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        (**self).aggregate(filter, aggregator).await
    }

    async fn add_index(
        &self,
        extractor: &(dyn ValueExtractor<K, V>),
        ordered: bool,
    ) -> Result<(), BackendError> {
        (**self).add_index(extractor, ordered).await
    }

    async fn subscribe(
        &self,
        target: SubscriptionTarget<K, V>,
        mode: SubscriptionMode,
        sink: mpsc::UnboundedSender<ChangeEvent<K, V>>,
    ) -> Result<SubscriptionId, BackendError> {
        (**self).subscribe(target, mode, sink).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        (**self).unsubscribe(id).await
    }

    fn deactivation_channel(&self) -> broadcast::Receiver<DeactivationEvent> {
        (**self).deactivation_channel()
    }
}

#[async_trait]
impl<K, V, B> BackCache<K, V> for Arc<B>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    B: BackCache<K, V> + Send + Sync + ?Sized,
{
    async fn get(&self, key: &K) -> Result<Option<V>, BackendError> {
        (**self).get(key).await
    }

    async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, BackendError> {
        (**self).get_all(keys).await
    }

    async fn insert(&self, key: K, value: V) -> Result<(), BackendError> {
        (**self).insert(key, value).await
    }

    async fn insert_all(&self, entries: Vec<(K, V)>) -> Result<(), BackendError> {
        (**self).insert_all(entries).await
    }

    async fn remove(&self, key: &K) -> Result<(), BackendError> {
        (**self).remove(key).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        (**self).clear().await
    }

    async fn truncate(&self) -> Result<(), BackendError> {
        (**self).truncate().await
    }

    async fn query(&self, filter: &BoxFilter<K, V>) -> Result<Vec<(K, V)>, BackendError> {
        (**self).query(filter).await
    }

    async fn invoke(
        &self,
        key: &K,
        processor: &(dyn EntryProcessor<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        (**self).invoke(key, processor).await
    }

    async fn aggregate(
        &self,
        filter: &BoxFilter<K, V>,
        aggregator: &(dyn Aggregator<K, V>),
    ) -> Result<Box<dyn Any + Send>, BackendError> {
        (**self).aggregate(filter, aggregator).await
    }

    async fn add_index(
        &self,
        extractor: &(dyn ValueExtractor<K, V>),
        ordered: bool,
    ) -> Result<(), BackendError> {
        (**self).add_index(extractor, ordered).await
    }

    async fn subscribe(
        &self,
        target: SubscriptionTarget<K, V>,
        mode: SubscriptionMode,
        sink: mpsc::UnboundedSender<ChangeEvent<K, V>>,
    ) -> Result<SubscriptionId, BackendError> {
        (**self).subscribe(target, mode, sink).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        (**self).unsubscribe(id).await
    }

    fn deactivation_channel(&self) -> broadcast::Receiver<DeactivationEvent> {
        (**self).deactivation_channel()
    }
}
