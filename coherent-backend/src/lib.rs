//! The `BackCache` trait and the subscription vocabulary it is built
//! around.
//!
//! This crate defines the seam between the coherent caching workspace and
//! a remote key/value store; it ships no concrete implementation of its
//! own (see `coherent-mock` for the in-process test double).

pub mod backend;
pub mod error;
pub mod subscription;

pub use backend::{Aggregator, BackCache, EntryProcessor, ValueExtractor};
pub use error::BackendError;
pub use subscription::{
    DeactivationEvent, ListenerRole, SubscriptionId, SubscriptionMode, SubscriptionTarget,
};
