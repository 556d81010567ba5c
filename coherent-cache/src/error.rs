//! Errors a `CompositeCache`/`ContinuousQueryCache` operation can return.

use coherent_backend::error::BackendError;

/// Failure surfaced by the coherent caching layer.
///
/// Composes [`BackendError`] via `#[from]`, the same way
/// `hitbox-backend`'s `BackendError` wraps its own lower-level error
/// types, and adds the FSM/validation failure kinds the coherence layer
/// itself can produce.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// The back cache rejected or failed the underlying operation.
    #[error("back cache operation failed")]
    Backend(#[from] BackendError),

    /// The cache has been deactivated (its back cache was deleted) and no
    /// longer serves calls until reconfigured.
    #[error("cache is inactive")]
    Inactive,

    /// A caller attempted a state transition that is not valid from the
    /// cache's current state (e.g. configuring while already
    /// configuring).
    #[error("invalid state transition from {from:?}")]
    InvalidStateTransition {
        /// The state the transition was attempted from.
        from: coherent_core::state::CacheState,
    },

    /// An entry read from the back cache does not satisfy the view's
    /// filter, and the caller's operation requires that it does (e.g.
    /// `insert` on a view with a predicate the new value fails).
    #[error("entry does not satisfy the view's filter")]
    PredicateViolation,

    /// The requested key is not currently a member of the view.
    #[error("key is not in the view")]
    OutOfView,

    /// The requested operation is not supported in the cache's current
    /// configuration (e.g. a write on a view with a value transformer).
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// A caller-supplied argument was invalid.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(&'static str),
}
