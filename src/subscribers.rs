//! Thread-safe multicast callback registry for data- and error-frame
//! subscribers. Add/remove happens under one lock; dispatch runs over a
//! snapshot copy so a handler removing itself (or another) mid-delivery
//! cannot corrupt the iteration.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque ticket returned by [`Subscribers::add`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscribers<T> {
    entries: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, handler: Handler<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().unwrap().push((id, handler));
        id
    }

    /// Returns false when the id was already removed.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Best-effort fan-out: every currently registered handler sees the
    /// value exactly once; a panicking handler is caught and logged and
    /// never prevents delivery to the remaining handlers.
    pub fn dispatch(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                log::warn!("frame subscriber panicked; continuing delivery");
            }
        }
    }
}
