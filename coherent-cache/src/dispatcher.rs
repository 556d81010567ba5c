//! A single background worker fanning deferred events out to listeners.
//!
//! Grounded on `hitbox::offload::manager::OffloadManager`: a lazily
//! started `tokio::spawn` task, `tracing` instrumentation around each unit
//! of work, and a graceful stop path — scaled from "N deduplicated
//! in-flight fetch tasks tracked in a `DashMap`" down to "one FIFO worker
//! queue", scaled down to a single FIFO worker queue rather than per-key
//! concurrency.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use coherent_core::event::ChangeEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

/// A listener callback: receives an event, does whatever bookkeeping it
/// needs (mark a key a CQC member, evict a front entry, etc), and returns.
pub type ListenerFn<K, V> = Arc<dyn Fn(ChangeEvent<K, V>) + Send + Sync>;

struct Job<K, V> {
    event: ChangeEvent<K, V>,
    listener: ListenerFn<K, V>,
}

struct WorkerHandle<K, V> {
    sender: mpsc::UnboundedSender<Job<K, V>>,
    task: JoinHandle<()>,
}

/// Defers event delivery off the calling task, preserving FIFO order
/// per listener queue (a single global FIFO, since all jobs share one
/// worker).
pub struct EventDispatcher<K, V> {
    worker: Mutex<Option<WorkerHandle<K, V>>>,
}

impl<K, V> Default for EventDispatcher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> EventDispatcher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// Builds a dispatcher with no worker running yet.
    pub fn new() -> Self {
        EventDispatcher { worker: Mutex::new(None) }
    }

    /// Enqueues `event` for asynchronous delivery to `listener`, starting
    /// the background worker first if this is the first dispatch since
    /// construction or the last [`EventDispatcher::stop`].
    ///
    /// Requires a `tokio` runtime to be current, since starting the
    /// worker spawns a task.
    pub fn dispatch(&self, event: ChangeEvent<K, V>, listener: ListenerFn<K, V>) {
        let mut guard = self.worker.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Self::spawn_worker());
        }
        if let Some(handle) = guard.as_ref() {
            let _ = handle.sender.send(Job { event, listener });
        }
    }

    /// Delivers `event` synchronously on the caller's task, bypassing the
    /// worker queue entirely. Used for priming events and for listeners
    /// a subscription marks as wanting synchronous delivery — a
    /// synchronous bypass of the worker queue.
    pub fn dispatch_sync(event: ChangeEvent<K, V>, listener: &ListenerFn<K, V>) {
        (listener)(event);
    }

    fn spawn_worker() -> WorkerHandle<K, V> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job<K, V>>();
        let task = tokio::spawn(async move {
            while let Some(Job { event, listener }) = receiver.recv().await {
                trace!("dispatching deferred event");
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| (listener)(event)));
                if let Err(panic) = outcome {
                    error!(?panic, "listener panicked during event dispatch");
                }
            }
        });
        WorkerHandle { sender, task }
    }

    /// Stops the background worker if one is running. A later `dispatch`
    /// call restarts it lazily. Queued jobs that have not yet run are
    /// dropped.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.task.abort();
        }
    }

    /// Whether a worker is currently running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }
}

impl<K, V> Drop for EventDispatcher<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_core::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn dispatch_starts_worker_lazily_and_delivers() {
        let dispatcher: EventDispatcher<&str, i32> = EventDispatcher::new();
        assert!(!dispatcher.is_running());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let listener: ListenerFn<&str, i32> = Arc::new(move |_event| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(ChangeEvent::new(EventKind::Inserted, "a", None, Some(1)), listener);
        assert!(dispatcher.is_running());

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_kill_the_worker() {
        let dispatcher: EventDispatcher<&str, i32> = EventDispatcher::new();
        let panicking: ListenerFn<&str, i32> = Arc::new(|_event| panic!("boom"));
        dispatcher.dispatch(ChangeEvent::new(EventKind::Inserted, "a", None, Some(1)), panicking);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let listener: ListenerFn<&str, i32> = Arc::new(move |_event| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(ChangeEvent::new(EventKind::Inserted, "b", None, Some(2)), listener);

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
