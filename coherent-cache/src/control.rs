//! The control table: arbitrates application calls against asynchronously
//! delivered back cache events.
//!
//! Grounded on `hitbox::concurrency`'s `DashMap`-keyed-by-key registry and
//! its `Entry`-API-driven atomic-insert pattern (`check`/register-if-absent
//! idiom used by `BroadcastConcurrencyManager`) — generalized from "one
//! broadcast slot per in-flight fetch" to "one deferred-event FIFO per
//! in-flight call", since this table's job is event bookkeeping, not
//! fetch deduplication.
//!
//! A single additional `RwLock<()>` acts as a GLOBAL gate: ordinary
//! per-key calls take it for shared read, a structural reset (CQC
//! reconfiguration, deactivation handling) takes it for exclusive write.
//! It need not be fair; it only needs to keep per-key work and whole-view
//! resets from interleaving.

use std::hash::Hash;
use std::sync::Arc;

use coherent_core::event::ChangeEvent;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::pending::{PendingEventList, PendingRecord};

struct ControlTableInner<K, V> {
    locks: DashMap<K, Arc<Mutex<()>>>,
    pending: DashMap<K, Arc<PendingEventList<K, V>>>,
    global: Arc<RwLock<()>>,
}

/// Arbitrates per-key application calls against the back cache's event
/// stream. Cheaply cloneable — every clone shares the same underlying
/// tables.
pub struct ControlTable<K, V> {
    inner: Arc<ControlTableInner<K, V>>,
}

impl<K, V> Clone for ControlTable<K, V> {
    fn clone(&self) -> Self {
        ControlTable { inner: self.inner.clone() }
    }
}

impl<K, V> Default for ControlTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ControlTable<K, V>
where
    K: Eq + Hash,
{
    /// Builds an empty control table.
    pub fn new() -> Self {
        ControlTable {
            inner: Arc::new(ControlTableInner {
                locks: DashMap::new(),
                pending: DashMap::new(),
                global: Arc::new(RwLock::new(())),
            }),
        }
    }

    fn key_lock(&self, key: &K) -> Arc<Mutex<()>>
    where
        K: Clone,
    {
        self.inner
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the per-key lock for `key`, blocking until it is free, and
    /// registers a fresh [`PendingEventList`] for the call's duration.
    /// Also takes the GLOBAL gate for shared read, so the call cannot
    /// straddle a concurrent structural reset.
    pub async fn lock(&self, key: &K) -> KeyGuard<K, V>
    where
        K: Clone,
    {
        let global = self.inner.global.clone().read_owned().await;
        let key_lock = self.key_lock(key);
        let key_guard = key_lock.lock_owned().await;
        let pending = Arc::new(PendingEventList::new());
        self.inner.pending.insert(key.clone(), pending.clone());
        KeyGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            pending,
            _key_guard: key_guard,
            _global_guard: global,
        }
    }

    /// Like [`ControlTable::lock`], but returns `None` immediately instead
    /// of waiting if the per-key lock is currently held.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard<K, V>>
    where
        K: Clone,
    {
        let global = self.inner.global.clone().try_read_owned().ok()?;
        let key_lock = self.key_lock(key);
        let key_guard = key_lock.try_lock_owned().ok()?;
        let pending = Arc::new(PendingEventList::new());
        self.inner.pending.insert(key.clone(), pending.clone());
        Some(KeyGuard {
            inner: self.inner.clone(),
            key: key.clone(),
            pending,
            _key_guard: key_guard,
            _global_guard: global,
        })
    }

    /// The event-ingest path: offers an event for `key`. If an application
    /// call currently has a pending list registered for this key, the
    /// event is deferred into it and `true` is returned — the caller must
    /// not also apply the event directly, since the in-flight call's
    /// validation rule owns that decision. Otherwise returns `false`: no
    /// call is in flight, the event should be applied immediately.
    pub fn offer(&self, key: &K, event: ChangeEvent<K, V>) -> bool
    where
        K: Clone,
    {
        match self.inner.pending.get(key) {
            Some(pending) => {
                pending.push(event);
                true
            }
            None => false,
        }
    }

    /// Forces every pending list currently registered to be treated as
    /// invalid, via the `Ignore` sentinel — used when a structural reset
    /// makes the usual per-key validation rule meaningless (e.g. the back
    /// cache was just deleted while calls were in flight).
    pub fn ignore_all_pending(&self) {
        for entry in self.inner.pending.iter() {
            entry.value().push_ignore();
        }
    }

    /// Acquires the GLOBAL gate exclusively. Held for the duration of a
    /// structural reset (CQC reconfiguration, deactivation handling);
    /// blocks every concurrent per-key call until released.
    pub async fn lock_global(&self) -> OwnedRwLockWriteGuard<()> {
        self.inner.global.clone().write_owned().await
    }
}

/// Holds a key's lock plus its registered [`PendingEventList`] for the
/// duration of one application call. Dropping it releases the lock and
/// deregisters the pending list.
pub struct KeyGuard<K, V> {
    inner: Arc<ControlTableInner<K, V>>,
    key: K,
    pending: Arc<PendingEventList<K, V>>,
    _key_guard: OwnedMutexGuard<()>,
    _global_guard: OwnedRwLockReadGuard<()>,
}

impl<K, V> KeyGuard<K, V> {
    /// Drains and returns every record deferred since the guard was
    /// acquired, without releasing the lock.
    pub fn drain_pending(&self) -> Vec<PendingRecord<K, V>> {
        self.pending.drain()
    }

    /// Releases the lock. Equivalent to dropping the guard; named to
    /// match the control table's own vocabulary.
    pub fn unlock(self) {}
}

impl<K, V> Drop for KeyGuard<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.inner.pending.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_core::EventKind;

    #[tokio::test]
    async fn offer_without_lock_is_not_deferred() {
        let table: ControlTable<&str, i32> = ControlTable::new();
        let deferred = table.offer(&"a", ChangeEvent::new(EventKind::Inserted, "a", None, Some(1)));
        assert!(!deferred);
    }

    #[tokio::test]
    async fn offer_while_locked_is_deferred_and_drained() {
        let table: ControlTable<&str, i32> = ControlTable::new();
        let guard = table.lock(&"a").await;

        let deferred = table.offer(&"a", ChangeEvent::new(EventKind::Updated, "a", Some(1), Some(2)));
        assert!(deferred);

        let records = guard.drain_pending();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn try_lock_fails_while_held() {
        let table: ControlTable<&str, i32> = ControlTable::new();
        let _guard = table.lock(&"a").await;
        assert!(table.try_lock(&"a").is_none());
    }

    #[tokio::test]
    async fn dropping_guard_deregisters_pending_list() {
        let table: ControlTable<&str, i32> = ControlTable::new();
        {
            let _guard = table.lock(&"a").await;
        }
        let deferred = table.offer(&"a", ChangeEvent::new(EventKind::Inserted, "a", None, Some(1)));
        assert!(!deferred);
    }

    #[tokio::test]
    async fn global_lock_excludes_per_key_locks() {
        let table: ControlTable<&str, i32> = ControlTable::new();
        let _global = table.lock_global().await;
        // A shared per-key lock attempt would block behind the exclusive
        // GLOBAL guard; try_lock must observe that rather than deadlock.
        assert!(table.try_lock(&"a").is_none());
    }
}
