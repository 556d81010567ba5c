//! Invalidation strategies: how a `CompositeCache` reacts to a back cache
//! event for a key it may or may not currently hold in its front.

use coherent_core::event::{ChangeEvent, EventKind};

/// Governs whether a back cache event invalidates a `CompositeCache`'s
/// front entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationStrategy {
    /// Never invalidate on events; the front is only ever cleared by an
    /// explicit `release`/`clear` call. Suitable only for read-mostly data
    /// where staleness is acceptable.
    None,
    /// Invalidate only keys currently present in the front. The usual
    /// choice: avoids paying any bookkeeping cost for keys the front has
    /// never cached.
    Present,
    /// Invalidate unconditionally, whether or not the key is currently in
    /// the front — used when the front wants to track negative results
    /// (a key's absence) as well as positive ones.
    All,
    /// Like `All` — invalidates unconditionally, regardless of local
    /// membership — except a synthetic `Deleted` event (back-cache-internal
    /// eviction/expiry) is filtered out, so the front isn't cleared by
    /// housekeeping the back did on its own.
    Logical,
    /// Selects the appropriate concrete strategy automatically. Currently
    /// equivalent to `Present` — there is no signal available yet (e.g.
    /// back cache size/read-heaviness) that would justify choosing
    /// differently.
    Auto,
}

impl InvalidationStrategy {
    /// Whether an event for `key` should invalidate the front entry,
    /// given whether the front currently holds that key.
    pub fn should_invalidate<K, V>(self, front_has_key: bool, event: &ChangeEvent<K, V>) -> bool {
        match self {
            InvalidationStrategy::None => false,
            InvalidationStrategy::Present | InvalidationStrategy::Auto => front_has_key,
            InvalidationStrategy::All => true,
            InvalidationStrategy::Logical => {
                !(event.synthetic && matches!(event.kind, EventKind::Deleted))
            }
        }
    }
}

impl Default for InvalidationStrategy {
    fn default() -> Self {
        InvalidationStrategy::Auto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_core::EventKind;

    fn event(synthetic: bool) -> ChangeEvent<&'static str, i32> {
        let mut event = ChangeEvent::new(EventKind::Deleted, "a", Some(1), None);
        event.synthetic = synthetic;
        event
    }

    fn inserted(synthetic: bool) -> ChangeEvent<&'static str, i32> {
        let mut event = ChangeEvent::new(EventKind::Inserted, "a", None, Some(1));
        event.synthetic = synthetic;
        event
    }

    #[test]
    fn none_never_invalidates() {
        assert!(!InvalidationStrategy::None.should_invalidate(true, &event(false)));
    }

    #[test]
    fn present_requires_local_membership() {
        assert!(InvalidationStrategy::Present.should_invalidate(true, &event(false)));
        assert!(!InvalidationStrategy::Present.should_invalidate(false, &event(false)));
    }

    #[test]
    fn all_ignores_local_membership() {
        assert!(InvalidationStrategy::All.should_invalidate(false, &event(false)));
    }

    #[test]
    fn logical_filters_only_synthetic_deletes() {
        assert!(InvalidationStrategy::Logical.should_invalidate(true, &event(false)));
        assert!(!InvalidationStrategy::Logical.should_invalidate(true, &event(true)));
    }

    #[test]
    fn logical_invalidates_unconditionally_like_all() {
        // Not locally cached, and not even a delete — Logical must behave
        // like All here, not like Present.
        assert!(InvalidationStrategy::Logical.should_invalidate(false, &inserted(true)));
        assert!(InvalidationStrategy::Logical.should_invalidate(false, &inserted(false)));
    }

    #[test]
    fn auto_matches_present() {
        assert_eq!(
            InvalidationStrategy::Auto.should_invalidate(true, &event(false)),
            InvalidationStrategy::Present.should_invalidate(true, &event(false))
        );
    }
}
