//! Subscription vocabulary: what a listener is registered against, and what
//! role it plays once registered.
//!
//! Listener differences are modeled as tagged variants of a single
//! listener-role enumeration, [`ListenerRole`], rather than a hierarchy of
//! listener types. Subscription/event fan-out has no close analogue in a
//! poll/get-based cache, so this module is built fresh.

use coherent_core::filter::BoxFilter;
use std::fmt;

/// What a subscription is registered against.
pub enum SubscriptionTarget<K, V> {
    /// A single key.
    Key(K),
    /// Every key matching a filter.
    Filter(BoxFilter<K, V>),
    /// Every key in the back cache.
    All,
}

impl<K: fmt::Debug, V> fmt::Debug for SubscriptionTarget<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTarget::Key(key) => f.debug_tuple("Key").field(key).finish(),
            SubscriptionTarget::Filter(_) => f.debug_tuple("Filter").field(&"..").finish(),
            SubscriptionTarget::All => write!(f, "All"),
        }
    }
}

/// Whether a subscription wants full event payloads or the reduced
/// "lite" form (no old value, used for listeners that only need to know
/// something changed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Events carry both old and new values where the event kind allows.
    Standard,
    /// Events carry only the new value; `old` is always `None`.
    Lite,
}

/// The role a listener plays in the owning cache's internal machinery.
///
/// A single enumeration standing in for what would otherwise be distinct
/// listener subclasses: the behavioral differences between "maintain a
/// CQC's member set", "invalidate a composite cache's front entry", and
/// "evict a front entry under local memory pressure" are expressed as match
/// arms over this tag, not as separate trait implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerRole {
    /// Adds a key to a continuous query view's member set when it starts
    /// satisfying the view's filter.
    AddToView,
    /// Removes a key from a continuous query view's member set when it
    /// stops satisfying the view's filter, or is deleted.
    RemoveFromView,
    /// Delivers the synthetic initial event for a freshly (re)registered
    /// subscription.
    Priming,
    /// Invalidates a composite cache's front entry in response to a back
    /// cache mutation.
    Invalidate,
    /// Evicts a front entry under local memory pressure — not itself
    /// driven by a back cache event, but tagged here for symmetry with the
    /// other roles a listener can play. No local eviction policy is
    /// implemented yet (see spec.md's Non-goals); reserved for one.
    FrontEviction,
    /// Reacts to the back cache itself being deleted or truncated.
    Deactivation,
}

/// An active subscription's identity, opaque to callers beyond equality and
/// use as an `unsubscribe` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Builds a subscription id from a back cache's own counter or key
    /// space. Opaque to everything outside the issuing implementation.
    pub fn new(id: u64) -> Self {
        SubscriptionId(id)
    }
}

/// Reported on a back cache's deactivation channel.
///
/// A `Deleted` event drives a `ContinuousQueryCache` to `Disconnected` and
/// a `CompositeCache` to reset its front and invalidation strategy; a
/// `Truncated` event clears internal storage while leaving the FSM state
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeactivationEvent {
    /// The back cache (or the subscribed key/filter's backing store) was
    /// destroyed.
    Deleted,
    /// The back cache's contents were cleared without destroying it.
    Truncated,
}
