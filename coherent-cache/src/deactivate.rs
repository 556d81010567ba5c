//! Deactivation listener wiring, shared by `CompositeCache` and
//! `ContinuousQueryCache`.
//!
//! A back cache `Deleted` event drives a CQC to `Disconnected` and a
//! composite cache to reset its front and invalidation strategy; a
//! `Truncated` event clears internal storage while leaving the FSM state
//! untouched. Both caches hand this module an async action for each case
//! and get a background task back that runs them as deactivation events
//! arrive.

use std::future::Future;

use coherent_backend::subscription::{DeactivationEvent, ListenerRole};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// A short, stable label for a [`ListenerRole`], for log fields — shared by
/// every call site that tags a subscription or background task with its
/// role rather than leaving `ListenerRole` only named in type position.
pub fn describe_role(role: ListenerRole) -> &'static str {
    match role {
        ListenerRole::AddToView => "add-to-view",
        ListenerRole::RemoveFromView => "remove-from-view",
        ListenerRole::Priming => "priming",
        ListenerRole::Invalidate => "invalidate",
        ListenerRole::FrontEviction => "front-eviction",
        ListenerRole::Deactivation => "deactivation",
    }
}

/// Spawns a task that drives `on_deleted`/`on_truncated` off `receiver`
/// until the sending back cache is dropped.
///
/// A lagged receiver (the back cache deactivated more than once before
/// this task could keep up) is treated as a `Deleted` — the strongest of
/// the two reactions — since a missed event could have been either kind
/// and `Deleted` is always safe to over-apply.
pub fn spawn_deactivation_listener<FD, FD2, FT, FT2>(
    mut receiver: broadcast::Receiver<DeactivationEvent>,
    on_deleted: FD,
    on_truncated: FT,
) -> JoinHandle<()>
where
    FD: Fn() -> FD2 + Send + 'static,
    FD2: Future<Output = ()> + Send + 'static,
    FT: Fn() -> FT2 + Send + 'static,
    FT2: Future<Output = ()> + Send + 'static,
{
    trace!(role = describe_role(ListenerRole::Deactivation), "starting deactivation listener");
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(DeactivationEvent::Deleted) => on_deleted().await,
                Ok(DeactivationEvent::Truncated) => on_truncated().await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed deactivation events; treating as deleted");
                    on_deleted().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn deleted_and_truncated_route_to_the_right_action() {
        let (sender, receiver) = broadcast::channel(4);
        let deletes = Arc::new(AtomicUsize::new(0));
        let truncates = Arc::new(AtomicUsize::new(0));

        let deletes_clone = deletes.clone();
        let truncates_clone = truncates.clone();
        let handle = spawn_deactivation_listener(
            receiver,
            move || {
                let deletes = deletes_clone.clone();
                async move {
                    deletes.fetch_add(1, Ordering::SeqCst);
                }
            },
            move || {
                let truncates = truncates_clone.clone();
                async move {
                    truncates.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        sender.send(DeactivationEvent::Truncated).unwrap();
        sender.send(DeactivationEvent::Deleted).unwrap();
        drop(sender);
        let _ = handle.await;

        assert_eq!(truncates.load(Ordering::SeqCst), 1);
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
    }
}
