//! Shared health state for the /health endpoint.
//! Updated when events are published after commits.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// Events handed to the notification channel.
    pub events_published: AtomicU64,
    /// Events dropped because the channel was full or closed.
    pub events_dropped: AtomicU64,
    /// Millisecond timestamp of the last published event (0 = none).
    pub last_event_at_ms: AtomicI64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self, at_ms: i64) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.last_event_at_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn last_event_at_ms(&self) -> i64 {
        self.last_event_at_ms.load(Ordering::Relaxed)
    }
}
