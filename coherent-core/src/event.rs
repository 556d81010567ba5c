//! Change events as delivered by a back cache's listener channel.
//!
//! Every event the core reacts to carries a `kind`, the affected `key`,
//! the old/new values (either side may be absent), and two independent
//! provenance flags.

use std::fmt;

/// The three kinds of mutation a back cache can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A key that did not previously exist was created.
    Inserted,
    /// An existing key's value changed.
    Updated,
    /// A key was removed.
    Deleted,
}

/// A single change notification for one key.
///
/// `old`/`new` follow the natural meaning for each [`EventKind`]: `Inserted`
/// events carry `old = None`, `Deleted` events carry `new = None`. Both can
/// be `None` only for a priming event reporting absence.
#[derive(Clone)]
pub struct ChangeEvent<K, V> {
    /// What happened.
    pub kind: EventKind,
    /// The key this event is about.
    pub key: K,
    /// Value before the change, if any.
    pub old: Option<V>,
    /// Value after the change, if any.
    pub new: Option<V>,
    /// Set when the back cache generated this event itself (eviction,
    /// expiry, internal reload) rather than in response to an external
    /// write. Logical strategy filters these out of Delete notifications.
    pub synthetic: bool,
    /// Set when this event is the single initial event a back cache is
    /// contractually obligated to deliver right after a listener is
    /// (re)registered for a key or an `inKeySet`-enumerated filter.
    pub priming: bool,
}

impl<K, V> ChangeEvent<K, V> {
    /// Builds an ordinary (non-synthetic, non-priming) event.
    pub fn new(kind: EventKind, key: K, old: Option<V>, new: Option<V>) -> Self {
        ChangeEvent {
            kind,
            key,
            old,
            new,
            synthetic: false,
            priming: false,
        }
    }

    /// Builds the synthetic priming event a back cache sends right after a
    /// listener is (re)registered, carrying the value current at
    /// subscription time (or `None` if the key does not exist).
    pub fn priming(key: K, value: Option<V>) -> Self {
        ChangeEvent {
            kind: EventKind::Inserted,
            key,
            old: None,
            new: value,
            synthetic: true,
            priming: true,
        }
    }

    /// True for an `Inserted` event whose `synthetic` flag is set — the
    /// shape a priming event always has, used by the validation rule in
    /// `coherent-cache::composite` to recognize priming without relying on
    /// the `priming` flag alone (a back variant may set only `synthetic`).
    pub fn is_synthetic_insert(&self) -> bool {
        self.synthetic && matches!(self.kind, EventKind::Inserted)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for ChangeEvent<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("synthetic", &self.synthetic)
            .field("priming", &self.priming)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priming_event_is_a_synthetic_insert() {
        let event: ChangeEvent<&str, i32> = ChangeEvent::priming("k", Some(42));
        assert!(event.is_synthetic_insert());
        assert!(event.priming);
        assert_eq!(event.new, Some(42));
    }

    #[test]
    fn plain_insert_is_not_flagged() {
        let event = ChangeEvent::new(EventKind::Inserted, "k", None, Some(1));
        assert!(!event.is_synthetic_insert());
        assert!(!event.priming);
    }
}
