//! `CompositeCache` and `ContinuousQueryCache`: the coherent caching layer
//! proper, built on a shared `ControlTable`, per-key `PendingEventList`s,
//! and a single-worker `EventDispatcher`.
//!
//! See `composite` for the front/back read-through cache and `cqc` for the
//! continuously-maintained materialized view. Both consume a
//! `coherent_backend::BackCache` and emit `coherent_core` events/filters.

pub mod composite;
pub mod config;
pub mod control;
pub mod cqc;
pub mod deactivate;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pending;
pub mod strategy;

pub use composite::{CompositeCache, CompositeCacheStatistics};
pub use config::{CompositeConfig, CompositeConfigBuilder, CqcConfig, CqcConfigBuilder};
pub use control::ControlTable;
pub use cqc::{
    CacheListenerOptions, CacheStatistics, ContinuousQueryCache, IndexId, ListenerId,
};
pub use dispatcher::EventDispatcher;
pub use error::CacheError;
pub use strategy::InvalidationStrategy;
