//! Per-key deferred-event queues.
//!
//! While an application call against a key is in flight, any back cache
//! event for that key is deferred into a [`PendingEventList`] instead of
//! being applied immediately — the in-flight call's own validation rule
//! decides, once it completes, whether the deferred events invalidate its
//! result. This is a fresh construction: `hitbox::concurrency`'s
//! equivalent primitive exists to prevent duplicate concurrent *fetches*
//! (dogpile prevention via a broadcast channel), not to log events racing
//! a call, so the FIFO/sentinel shape here has no direct analogue there.

use std::collections::VecDeque;
use std::sync::Mutex;

use coherent_core::event::ChangeEvent;

/// One slot in a [`PendingEventList`].
pub enum PendingRecord<K, V> {
    /// A real event observed while the list was registered.
    Event(ChangeEvent<K, V>),
    /// A sentinel meaning "the in-flight call's result must be treated as
    /// invalid regardless of how many real events did or didn't arrive" —
    /// used when a structural reset (deactivation, reconfiguration)
    /// happens concurrently with the call and the usual event-counting
    /// validation rule no longer applies.
    Ignore,
}

/// A FIFO of deferred events for a single key, registered for the
/// lifetime of one in-flight application call.
pub struct PendingEventList<K, V> {
    records: Mutex<VecDeque<PendingRecord<K, V>>>,
}

impl<K, V> PendingEventList<K, V> {
    /// Builds an empty list.
    pub fn new() -> Self {
        PendingEventList { records: Mutex::new(VecDeque::new()) }
    }

    /// Appends a real event.
    pub fn push(&self, event: ChangeEvent<K, V>) {
        self.records.lock().unwrap().push_back(PendingRecord::Event(event));
    }

    /// Appends the `Ignore` sentinel.
    pub fn push_ignore(&self) {
        self.records.lock().unwrap().push_back(PendingRecord::Ignore);
    }

    /// Drains every record collected so far, in arrival order.
    pub fn drain(&self) -> Vec<PendingRecord<K, V>> {
        self.records.lock().unwrap().drain(..).collect()
    }

    /// Whether any record has been collected.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl<K, V> Default for PendingEventList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherent_core::EventKind;

    #[test]
    fn drain_returns_in_order_and_empties() {
        let list: PendingEventList<&str, i32> = PendingEventList::new();
        list.push(ChangeEvent::new(EventKind::Updated, "a", Some(1), Some(2)));
        list.push_ignore();

        let records = list.drain();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], PendingRecord::Event(_)));
        assert!(matches!(records[1], PendingRecord::Ignore));
        assert!(list.is_empty());
    }
}
