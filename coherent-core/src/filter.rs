//! Filter algebra: the predicate vocabulary a view subscribes with.
//!
//! [`Filter`] is the synchronous `entry → bool` evaluator the core treats
//! as an out-of-scope external collaborator — it only consumes the
//! predicate's `evaluate(entry) → bool` operation. The trait here is
//! exactly that seam, generalized from `hitbox_core::predicate::Predicate` (an async,
//! subject-consuming trait used for HTTP cacheability decisions) into a
//! synchronous `(key, value) -> bool` evaluator, because a query filter
//! evaluation is pure and does not need to own or await its subject.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Evaluates whether a `(key, value)` pair belongs to a view.
///
/// `value` is `None` when the evaluator is asked about a key whose value is
/// not locally known (e.g. a deferred-event reconciliation read that came
/// back empty) — most filters treat that as "does not satisfy".
pub trait Filter<K, V>: Send + Sync {
    /// Evaluates the predicate.
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool;
}

/// Type-erased filter, the form filters take once a view is constructed.
pub type BoxFilter<K, V> = Arc<dyn Filter<K, V> + Send + Sync>;

impl<K, V> Filter<K, V> for Arc<dyn Filter<K, V> + Send + Sync> {
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        self.as_ref().evaluate(key, value)
    }
}

/// Always-true filter — the identity element for `And`, used when a view
/// has no real predicate of its own (e.g. "all entries").
#[derive(Debug, Clone, Copy, Default)]
pub struct Neutral;

impl<K, V> Filter<K, V> for Neutral {
    fn evaluate(&self, _key: &K, _value: Option<&V>) -> bool {
        true
    }
}

/// Requires both filters to accept. Short-circuits on the left.
#[derive(Debug)]
pub struct And<L, R> {
    left: L,
    right: R,
}

impl<L, R> And<L, R> {
    /// Builds a conjunction of two filters.
    pub fn new(left: L, right: R) -> Self {
        And { left, right }
    }
}

impl<K, V, L, R> Filter<K, V> for And<L, R>
where
    L: Filter<K, V>,
    R: Filter<K, V>,
{
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        self.left.evaluate(key, value) && self.right.evaluate(key, value)
    }
}

/// Requires either filter to accept. Short-circuits on the left.
#[derive(Debug)]
pub struct Or<L, R> {
    left: L,
    right: R,
}

impl<L, R> Or<L, R> {
    /// Builds a disjunction of two filters.
    pub fn new(left: L, right: R) -> Self {
        Or { left, right }
    }
}

impl<K, V, L, R> Filter<K, V> for Or<L, R>
where
    L: Filter<K, V>,
    R: Filter<K, V>,
{
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        self.left.evaluate(key, value) || self.right.evaluate(key, value)
    }
}

/// Inverts a filter's result. Named `NotFilter` in the subscription
/// vocabulary; it is the same combinator used for general predicate
/// composition.
#[derive(Debug)]
pub struct Not<P> {
    inner: P,
}

impl<P> Not<P> {
    /// Wraps a filter, inverting its result.
    pub fn new(inner: P) -> Self {
        Not { inner }
    }
}

impl<K, V, P> Filter<K, V> for Not<P>
where
    P: Filter<K, V>,
{
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        !self.inner.evaluate(key, value)
    }
}

/// The subscription vocabulary's `NotFilter` alias — same type, named for
/// readers expecting that spelling.
pub type NotFilter<P> = Not<P>;

/// Fluent combinator methods, mirroring `hitbox_core::predicate::PredicateExt`.
pub trait FilterExt<K, V>: Filter<K, V> + Sized {
    /// Conjunction with another filter.
    fn and<R: Filter<K, V>>(self, right: R) -> And<Self, R> {
        And::new(self, right)
    }

    /// Disjunction with another filter.
    fn or<R: Filter<K, V>>(self, right: R) -> Or<Self, R> {
        Or::new(self, right)
    }

    /// Negation.
    fn not(self) -> Not<Self> {
        Not::new(self)
    }

    /// Type-erases this filter.
    fn boxed(self) -> BoxFilter<K, V>
    where
        Self: Send + Sync + 'static,
    {
        Arc::new(self)
    }
}

impl<K, V, T: Filter<K, V> + Sized> FilterExt<K, V> for T {}

/// Accepts only keys present in an enumerated set, on top of an inner
/// filter. `subscribe` with a filter accepts an `inKeySet` modifier that
/// delivers priming events for exactly the enumerated keys atomically at
/// subscribe time; `InKeySetFilter` is the predicate form of that
/// modifier.
pub struct InKeySetFilter<K, V> {
    keys: HashSet<K>,
    inner: BoxFilter<K, V>,
}

impl<K: Eq + Hash, V> InKeySetFilter<K, V> {
    /// Builds a filter accepting only `keys`, further narrowed by `inner`.
    pub fn new(keys: HashSet<K>, inner: BoxFilter<K, V>) -> Self {
        InKeySetFilter { keys, inner }
    }
}

impl<K: Eq + Hash + Send + Sync, V: Send + Sync> Filter<K, V> for InKeySetFilter<K, V> {
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        self.keys.contains(key) && self.inner.evaluate(key, value)
    }
}

/// Mask of event kinds a subscription cares about:
/// `EventFilter(mask, inner)` with `mask ⊆ {Inserted, UpdatedEntered,
/// UpdatedLeft, UpdatedWithin, Deleted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    /// A key newly satisfies the view's filter by being inserted.
    pub const INSERTED: EventMask = EventMask(1 << 0);
    /// A key newly satisfies the view's filter after an update (it did not
    /// before).
    pub const UPDATED_ENTERED: EventMask = EventMask(1 << 1);
    /// A key stops satisfying the view's filter after an update.
    pub const UPDATED_LEFT: EventMask = EventMask(1 << 2);
    /// A key continues to satisfy the view's filter across an update.
    pub const UPDATED_WITHIN: EventMask = EventMask(1 << 3);
    /// A key is deleted.
    pub const DELETED: EventMask = EventMask(1 << 4);

    /// The empty mask.
    pub const NONE: EventMask = EventMask(0);

    /// Unions two masks.
    pub const fn union(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }

    /// Whether `self` includes every bit set in `other`.
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        self.union(rhs)
    }
}

/// A subscription-side filter: an inner predicate plus the mask of event
/// kinds the back cache should actually deliver for it.
pub struct EventFilter<K, V> {
    mask: EventMask,
    inner: BoxFilter<K, V>,
}

impl<K, V> EventFilter<K, V> {
    /// Builds an event filter.
    pub fn new(mask: EventMask, inner: BoxFilter<K, V>) -> Self {
        EventFilter { mask, inner }
    }

    /// The event mask.
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// The wrapped entry predicate.
    pub fn inner(&self) -> &BoxFilter<K, V> {
        &self.inner
    }
}

impl<K: Send + Sync, V: Send + Sync> Filter<K, V> for EventFilter<K, V> {
    /// Delegates to the wrapped predicate. The mask governs which event
    /// *kinds* a subscription bothers receiving, not membership — so it
    /// plays no part in evaluating a given `(key, value)`.
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        self.inner.evaluate(key, value)
    }
}

impl<K, V> fmt::Debug for EventFilter<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

/// How a `TransformerFilter` rewrites the values riding along on an event
/// before a listener sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTransformMode {
    /// Apply the CQC's configured value transformer to `new` (and `old`,
    /// when present).
    Extract,
    /// Strip the old value, keeping only key + new value — the
    /// "semi-lite" transform used for add listeners that don't need the
    /// previous value.
    StripOld,
}

/// Wraps an [`EventFilter`] with the value-rewrite applied to every event
/// that passes it: `TransformerFilter(eventFilter, transformer)`.
pub struct TransformerFilter<K, V> {
    event_filter: EventFilter<K, V>,
    mode: ValueTransformMode,
}

impl<K, V> TransformerFilter<K, V> {
    /// Builds a transformer filter.
    pub fn new(event_filter: EventFilter<K, V>, mode: ValueTransformMode) -> Self {
        TransformerFilter { event_filter, mode }
    }

    /// The wrapped event filter.
    pub fn event_filter(&self) -> &EventFilter<K, V> {
        &self.event_filter
    }

    /// The transform mode.
    pub fn mode(&self) -> ValueTransformMode {
        self.mode
    }
}

/// A filter colocated with a single key's partition/association. The merge
/// rule peels this wrapper off, merges the inner filters, then re-wraps —
/// so the association survives filter composition unchanged.
pub struct KeyAssociatedFilter<K, V> {
    key: K,
    inner: BoxFilter<K, V>,
}

impl<K, V> KeyAssociatedFilter<K, V> {
    /// Builds a key-associated filter.
    pub fn new(key: K, inner: BoxFilter<K, V>) -> Self {
        KeyAssociatedFilter { key, inner }
    }
}

impl<K: PartialEq + Send + Sync, V: Send + Sync> Filter<K, V> for KeyAssociatedFilter<K, V> {
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        &self.key == key && self.inner.evaluate(key, value)
    }
}

/// A filter that caps how many entries a query should return. Limiting
/// itself is applied by the query executor, an out-of-scope external
/// collaborator; `evaluate` here only ever consults the inner predicate.
pub struct LimitFilter<K, V> {
    limit: usize,
    inner: BoxFilter<K, V>,
}

impl<K, V> LimitFilter<K, V> {
    /// Builds a limit filter.
    pub fn new(limit: usize, inner: BoxFilter<K, V>) -> Self {
        LimitFilter { limit, inner }
    }

    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl<K: Send + Sync, V: Send + Sync> Filter<K, V> for LimitFilter<K, V> {
    fn evaluate(&self, key: &K, value: Option<&V>) -> bool {
        self.inner.evaluate(key, value)
    }
}

/// An explicit expression tree over the filter algebra, used only where the
/// merge rule needs to pattern-match structure (peel a `KeyAssociated`/
/// `Limit` wrapper, preserve it, and re-wrap around the merged inner
/// filter). Plain [`Filter`] trait objects can't be destructured this way,
/// so the merge path builds and consumes this enum instead.
pub enum FilterExpr<K, V> {
    /// An opaque leaf predicate (already merged, or never wrapped).
    Leaf(BoxFilter<K, V>),
    /// A key-association wrapper around another expression.
    KeyAssociated {
        /// The associated key.
        key: K,
        /// The wrapped expression.
        inner: Box<FilterExpr<K, V>>,
    },
    /// A result-limit wrapper around another expression.
    Limit {
        /// The limit.
        limit: usize,
        /// The wrapped expression.
        inner: Box<FilterExpr<K, V>>,
    },
}

impl<K, V> FilterExpr<K, V>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Collapses the expression into an evaluatable filter.
    pub fn into_filter(self) -> BoxFilter<K, V> {
        match self {
            FilterExpr::Leaf(filter) => filter,
            FilterExpr::KeyAssociated { key, inner } => {
                Arc::new(KeyAssociatedFilter::new(key, inner.into_filter()))
            }
            FilterExpr::Limit { limit, inner } => {
                Arc::new(LimitFilter::new(limit, inner.into_filter()))
            }
        }
    }
}

/// Implements the filter-merge rule: if either side
/// is a key-association wrapper, peel it off and re-wrap after merging the
/// rest; if either side is a limit wrapper, preserve the limit while
/// combining its inner filter with the other side; otherwise conjoin.
pub fn merge_filters<K, V>(left: FilterExpr<K, V>, right: FilterExpr<K, V>) -> FilterExpr<K, V>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    match (left, right) {
        (FilterExpr::KeyAssociated { key, inner }, other) => FilterExpr::KeyAssociated {
            key,
            inner: Box::new(merge_filters(*inner, other)),
        },
        (other, FilterExpr::KeyAssociated { key, inner }) => FilterExpr::KeyAssociated {
            key,
            inner: Box::new(merge_filters(other, *inner)),
        },
        (FilterExpr::Limit { limit, inner }, other) => FilterExpr::Limit {
            limit,
            inner: Box::new(merge_filters(*inner, other)),
        },
        (other, FilterExpr::Limit { limit, inner }) => FilterExpr::Limit {
            limit,
            inner: Box::new(merge_filters(other, *inner)),
        },
        (a, b) => {
            let merged: BoxFilter<K, V> = Arc::new(And::new(a.into_filter(), b.into_filter()));
            FilterExpr::Leaf(merged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StartsWith(char);

    impl Filter<u32, String> for StartsWith {
        fn evaluate(&self, _key: &u32, value: Option<&String>) -> bool {
            value.is_some_and(|v| v.starts_with(self.0))
        }
    }

    #[test]
    fn and_short_circuits_and_combines() {
        let f = Neutral.and(StartsWith('b'));
        assert!(f.evaluate(&1, Some(&"banana".to_string())));
        assert!(!f.evaluate(&1, Some(&"apple".to_string())));
    }

    #[test]
    fn or_accepts_either() {
        let f = StartsWith('b').or(StartsWith('c'));
        assert!(f.evaluate(&1, Some(&"cherry".to_string())));
        assert!(!f.evaluate(&1, Some(&"date".to_string())));
    }

    #[test]
    fn not_inverts() {
        let f = StartsWith('b').not();
        assert!(f.evaluate(&1, Some(&"apple".to_string())));
    }

    #[test]
    fn in_key_set_requires_membership() {
        let keys: HashSet<u32> = [1, 2].into_iter().collect();
        let f = InKeySetFilter::new(keys, Arc::new(Neutral));
        assert!(f.evaluate(&1, Some(&"x".to_string())));
        assert!(!f.evaluate(&3, Some(&"x".to_string())));
    }

    #[test]
    fn event_mask_union_and_contains() {
        let mask = EventMask::INSERTED | EventMask::UPDATED_ENTERED;
        assert!(mask.contains(EventMask::INSERTED));
        assert!(!mask.contains(EventMask::DELETED));
    }

    #[test]
    fn merge_preserves_key_association_wrapper() {
        let inner: BoxFilter<u32, String> = Arc::new(StartsWith('b'));
        let left = FilterExpr::KeyAssociated {
            key: 7u32,
            inner: Box::new(FilterExpr::Leaf(inner)),
        };
        let right: FilterExpr<u32, String> = FilterExpr::Leaf(Arc::new(Neutral));
        let merged = merge_filters(left, right);
        assert!(matches!(merged, FilterExpr::KeyAssociated { key: 7, .. }));
    }

    #[test]
    fn merge_preserves_limit_wrapper() {
        let left: FilterExpr<u32, String> = FilterExpr::Limit {
            limit: 10,
            inner: Box::new(FilterExpr::Leaf(Arc::new(StartsWith('b')))),
        };
        let right: FilterExpr<u32, String> = FilterExpr::Leaf(Arc::new(StartsWith('c')));
        let merged = merge_filters(left, right);
        match merged {
            FilterExpr::Limit { limit, .. } => assert_eq!(limit, 10),
            _ => panic!("expected Limit wrapper to survive merge"),
        }
    }

    #[test]
    fn merge_plain_filters_conjoins() {
        let left: FilterExpr<u32, String> = FilterExpr::Leaf(Arc::new(StartsWith('b')));
        let right: FilterExpr<u32, String> = FilterExpr::Leaf(Arc::new(Neutral));
        let merged = merge_filters(left, right).into_filter();
        assert!(merged.evaluate(&1, Some(&"banana".to_string())));
        assert!(!merged.evaluate(&1, Some(&"cherry".to_string())));
    }
}
