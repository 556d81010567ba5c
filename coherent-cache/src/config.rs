//! Typestate builders for constructing a `CompositeCache`/
//! `ContinuousQueryCache`.
//!
//! Grounded on `hitbox::config`'s `ConfigBuilder`/`NotSet` pattern: a
//! required field starts out as the `NotSet` marker type, and the
//! `build()` method is only implemented once every required field's type
//! parameter has been replaced by `Set<T>` — so a cache can't be
//! constructed with a field forgotten, and the compiler (not a runtime
//! check) enforces it.

use std::marker::PhantomData;
use std::time::Duration;

use coherent_core::filter::BoxFilter;
use coherent_core::transform::BoxTransformer;

use crate::strategy::InvalidationStrategy;

/// Marks a builder field as not yet provided.
pub struct NotSet;

/// Marks a builder field as provided, carrying the value.
pub struct Set<T>(pub T);

/// Configuration for a [`crate::composite::CompositeCache`].
#[derive(Debug, Clone)]
pub struct CompositeConfig {
    /// Initial capacity hint for the front map.
    pub front_capacity_hint: usize,
    /// How front entries are invalidated on back cache events.
    pub invalidation_strategy: InvalidationStrategy,
    /// How long a per-key lock acquisition waits before giving up and
    /// falling through to the back cache uncached. `None` means wait
    /// indefinitely.
    pub lock_timeout: Option<Duration>,
}

/// Builds a [`CompositeConfig`]. All fields have defaults, so
/// `CompositeConfigBuilder::new().build()` is always valid — unlike the
/// CQC builder, nothing here is mandatory.
#[derive(Debug, Clone)]
pub struct CompositeConfigBuilder {
    front_capacity_hint: usize,
    invalidation_strategy: InvalidationStrategy,
    lock_timeout: Option<Duration>,
}

impl Default for CompositeConfigBuilder {
    fn default() -> Self {
        CompositeConfigBuilder {
            front_capacity_hint: 0,
            invalidation_strategy: InvalidationStrategy::Auto,
            lock_timeout: None,
        }
    }
}

impl CompositeConfigBuilder {
    /// Starts a new builder with every field defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the front map's initial capacity hint.
    pub fn front_capacity_hint(mut self, hint: usize) -> Self {
        self.front_capacity_hint = hint;
        self
    }

    /// Sets the invalidation strategy.
    pub fn invalidation_strategy(mut self, strategy: InvalidationStrategy) -> Self {
        self.invalidation_strategy = strategy;
        self
    }

    /// Sets the per-key lock acquisition timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> CompositeConfig {
        CompositeConfig {
            front_capacity_hint: self.front_capacity_hint,
            invalidation_strategy: self.invalidation_strategy,
            lock_timeout: self.lock_timeout,
        }
    }
}

/// Configuration for a [`crate::cqc::ContinuousQueryCache`]. The filter is
/// mandatory — a view with no predicate is just a `CompositeCache` — so
/// its presence is tracked at the type level via `FilterState`.
pub struct CqcConfig<K, V> {
    /// The predicate defining view membership.
    pub filter: BoxFilter<K, V>,
    /// Whether the view caches values locally (`true`) or only tracks
    /// membership (`false`, keys only).
    pub cache_values: bool,
    /// Optional value transform applied before storage; setting one
    /// forces the view read-only.
    pub transformer: Option<BoxTransformer<V, V>>,
    /// How long after a disconnect the view will attempt to resynchronize
    /// via the deferred-event path before falling back to a full
    /// re-population.
    pub reconnect_interval: Duration,
}

/// Builder for [`CqcConfig`]. `FilterState` is `NotSet` until
/// [`CqcConfigBuilder::filter`] is called; only then does `build()` exist.
pub struct CqcConfigBuilder<K, V, FilterState> {
    filter: FilterState,
    cache_values: bool,
    transformer: Option<BoxTransformer<V, V>>,
    reconnect_interval: Duration,
    _key: PhantomData<K>,
}

impl<K, V> CqcConfigBuilder<K, V, NotSet> {
    /// Starts a new builder. `cache_values` defaults to `true` and
    /// `reconnect_interval` defaults to five seconds.
    pub fn new() -> Self {
        CqcConfigBuilder {
            filter: NotSet,
            cache_values: true,
            transformer: None,
            reconnect_interval: Duration::from_secs(5),
            _key: PhantomData,
        }
    }
}

impl<K, V> Default for CqcConfigBuilder<K, V, NotSet> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, FilterState> CqcConfigBuilder<K, V, FilterState> {
    /// Sets the view's defining predicate.
    pub fn filter(self, filter: BoxFilter<K, V>) -> CqcConfigBuilder<K, V, Set<BoxFilter<K, V>>> {
        CqcConfigBuilder {
            filter: Set(filter),
            cache_values: self.cache_values,
            transformer: self.transformer,
            reconnect_interval: self.reconnect_interval,
            _key: PhantomData,
        }
    }

    /// Sets whether the view caches values locally.
    pub fn cache_values(mut self, cache_values: bool) -> Self {
        self.cache_values = cache_values;
        self
    }

    /// Sets a value transformer. Implies `cache_values(true)` and forces
    /// the resulting view read-only.
    pub fn transformer(mut self, transformer: BoxTransformer<V, V>) -> Self {
        self.transformer = Some(transformer);
        self.cache_values = true;
        self
    }

    /// Sets the reconnect interval.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

impl<K, V> CqcConfigBuilder<K, V, Set<BoxFilter<K, V>>> {
    /// Finishes the configuration. Only callable once a filter has been
    /// set — there is no `CqcConfig` without one.
    pub fn build(self) -> CqcConfig<K, V> {
        CqcConfig {
            filter: self.filter.0,
            cache_values: self.cache_values,
            transformer: self.transformer,
            reconnect_interval: self.reconnect_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_core::filter::Neutral;
    use std::sync::Arc;

    #[test]
    fn composite_builder_has_sane_defaults() {
        let config = CompositeConfigBuilder::new().build();
        assert_eq!(config.front_capacity_hint, 0);
        assert_eq!(config.invalidation_strategy, InvalidationStrategy::Auto);
        assert!(config.lock_timeout.is_none());
    }

    #[test]
    fn cqc_builder_requires_filter_before_build() {
        let filter: BoxFilter<&str, i32> = Arc::new(Neutral);
        let config = CqcConfigBuilder::new().filter(filter).cache_values(false).build();
        assert!(!config.cache_values);
    }
}
