//! Value transformers.
//!
//! A [`ContinuousQueryCache`](../../coherent_cache/cqc/struct.ContinuousQueryCache.html)
//! may carry an optional `Transformer` that maps each cached value before it
//! is stored in the view's internal storage. Setting one forces the view
//! read-only: once a transform is applied there is no value to write back.

use std::fmt;
use std::sync::Arc;

/// Maps a back value into the value a view actually stores.
///
/// Implemented as a plain synchronous closure trait — transformers are pure
/// projections (e.g. "string length"), not I/O.
pub trait Transformer<V>: Send + Sync {
    /// The type produced by the transform.
    type Output: Clone + Send + Sync;

    /// Applies the transform to a value read from the back cache.
    fn transform(&self, value: V) -> Self::Output;
}

impl<V, O, F> Transformer<V> for F
where
    F: Fn(V) -> O + Send + Sync,
    O: Clone + Send + Sync,
{
    type Output = O;

    fn transform(&self, value: V) -> O {
        (self)(value)
    }
}

/// Type-erased transformer, used once a CQC is constructed so its type
/// parameters don't have to name the closure.
pub struct BoxTransformer<V, O> {
    inner: Arc<dyn Fn(V) -> O + Send + Sync>,
}

impl<V, O> Clone for BoxTransformer<V, O> {
    fn clone(&self) -> Self {
        BoxTransformer {
            inner: self.inner.clone(),
        }
    }
}

impl<V, O> fmt::Debug for BoxTransformer<V, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxTransformer").finish_non_exhaustive()
    }
}

impl<V, O> BoxTransformer<V, O> {
    /// Boxes any function into a transformer.
    pub fn new(f: impl Fn(V) -> O + Send + Sync + 'static) -> Self {
        BoxTransformer { inner: Arc::new(f) }
    }

    /// Applies the transform.
    pub fn apply(&self, value: V) -> O {
        (self.inner)(value)
    }
}

/// The "semi-lite" transform a `Present`/`All` invalidation strategy applies
/// to events before they ever reach a non-standard listener: it strips the
/// old value, keeping only the key and the new value — the
/// `TransformerFilter`'s old-value-stripping mode.
pub fn strip_old_value<K, V>(event: crate::ChangeEvent<K, V>) -> crate::ChangeEvent<K, V> {
    crate::ChangeEvent {
        old: None,
        ..event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeEvent, EventKind};

    #[test]
    fn box_transformer_applies_closure() {
        let t: BoxTransformer<String, usize> = BoxTransformer::new(|s: String| s.len());
        assert_eq!(t.apply("apple".to_string()), 5);
    }

    #[test]
    fn strip_old_value_clears_old_keeps_new() {
        let event = ChangeEvent::new(EventKind::Updated, "k", Some(1), Some(2));
        let stripped = strip_old_value(event);
        assert_eq!(stripped.old, None);
        assert_eq!(stripped.new, Some(2));
    }
}
