//! Protocol-agnostic core types shared across the coherent caching
//! workspace.
//!
//! This crate knows nothing about locking, concurrency, or transport — it
//! only defines the vocabulary `coherent-backend` and `coherent-cache`
//! build on: change events, the filter algebra a view subscribes with,
//! value transformers, and the FSM driving (re)synchronization.

pub mod event;
pub mod filter;
pub mod state;
pub mod transform;

pub use event::{ChangeEvent, EventKind};
pub use filter::{
    And, BoxFilter, EventFilter, EventMask, Filter, FilterExpr, FilterExt, InKeySetFilter,
    KeyAssociatedFilter, LimitFilter, Neutral, Not, NotFilter, Or, TransformerFilter,
    ValueTransformMode, merge_filters,
};
pub use state::CacheState;
pub use transform::{BoxTransformer, Transformer, strip_old_value};
