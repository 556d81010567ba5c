//! Errors a [`crate::BackCache`] implementation reports.

/// Failure surfaced by a back cache operation.
///
/// Mirrors the shape of a typical remote-store failure taxonomy: a
/// transport-level failure, an opaque internal failure, an operation the
/// implementation does not support, and a not-found case kept distinct from
/// "absent value" (`get` returning `Ok(None)` is not an error).
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The back cache could not be reached.
    #[error("back cache connection failed")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The back cache reported an internal failure unrelated to
    /// connectivity.
    #[error("back cache internal error")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The requested operation is not supported by this back cache.
    #[error("operation not supported by this back cache: {0}")]
    Unsupported(&'static str),

    /// A subscription referenced by id no longer exists.
    #[error("unknown subscription")]
    UnknownSubscription,
}

impl BackendError {
    /// Wraps an arbitrary error as a [`BackendError::Connection`].
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        BackendError::Connection(Box::new(source))
    }

    /// Wraps an arbitrary error as a [`BackendError::Internal`].
    pub fn internal(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        BackendError::Internal(Box::new(source))
    }
}

