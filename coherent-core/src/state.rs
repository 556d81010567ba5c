//! The small synchronization state machine shared by `CompositeCache` and
//! `ContinuousQueryCache`.
//!
//! The FSM is modeled as tagged variants of a single enumeration — the
//! same choice [`ListenerRole`] in `coherent-backend` makes for listener
//! roles — rather than a trait-object hierarchy of per-state types.

/// Where a coherent view currently stands with respect to its back cache.
///
/// Transitions:
/// `Disconnected -> Configuring -> Configured -> Synchronized`, with
/// `Synchronized -> Configuring` on every reconfiguration and any state
/// `-> Disconnected` on deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// No subscription is registered; reads fall through to the back cache
    /// on every call with no local coherence guarantee.
    Disconnected,
    /// A (re)configuration is in flight: the listener has been registered
    /// but the initial population has not yet been reconciled with events
    /// that arrived during the registration window.
    Configuring,
    /// Initial population is reconciled; steady-state event delivery has
    /// not yet been confirmed to be caught up.
    Configured,
    /// Steady state: the local view reflects the back cache's contents as
    /// of the last delivered event, modulo in-flight application calls.
    Synchronized,
}

impl CacheState {
    /// Whether local reads may be served without falling through to the
    /// back cache. Only `Synchronized` offers that guarantee.
    pub fn is_coherent(self) -> bool {
        matches!(self, CacheState::Synchronized)
    }

    /// Whether a (re)configuration is currently in progress.
    pub fn is_configuring(self) -> bool {
        matches!(self, CacheState::Configuring)
    }
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_synchronized_is_coherent() {
        assert!(CacheState::Synchronized.is_coherent());
        assert!(!CacheState::Configured.is_coherent());
        assert!(!CacheState::Configuring.is_coherent());
        assert!(!CacheState::Disconnected.is_coherent());
    }

    #[test]
    fn default_is_disconnected() {
        assert_eq!(CacheState::default(), CacheState::Disconnected);
    }
}
