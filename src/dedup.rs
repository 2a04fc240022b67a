//! Bounded LRU cache of recently written event identities.
//!
//! An append with precondition `Any` carries no version to line its events
//! up against, so a retried request cannot be recognized by event number
//! alone. The cache remembers where each recently written event ID landed;
//! when a request's first event ID is found, the consistency checker compares
//! the following event numbers exactly as it would for an explicit version.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use uuid::Uuid;

/// Where a cached event was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentEvent {
    /// Stream the event was written to.
    pub stream: Arc<str>,
    /// Event number it received.
    pub event_number: i64,
}

/// LRU map from event ID to the stream and number it was written at.
pub struct RecentEvents {
    cache: LruCache<Uuid, RecentEvent>,
}

impl RecentEvents {
    /// Create a cache tracking at most `capacity` event IDs.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Where `event_id` was written, if it is still cached.
    ///
    /// Does not change the LRU order.
    pub fn lookup(&self, event_id: &Uuid) -> Option<&RecentEvent> {
        self.cache.peek(event_id)
    }

    /// Remember events written to `stream`.
    ///
    /// # Arguments
    ///
    /// * `stream` - Stream the events were written to.
    /// * `events` - `(event_id, event_number)` pairs in log order.
    pub fn record(&mut self, stream: &str, events: impl IntoIterator<Item = (Uuid, i64)>) {
        let stream: Arc<str> = Arc::from(stream);
        for (event_id, event_number) in events {
            self.cache.put(
                event_id,
                RecentEvent {
                    stream: Arc::clone(&stream),
                    event_number,
                },
            );
        }
    }

    /// Number of cached event IDs.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
