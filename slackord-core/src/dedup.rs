// ABOUTME: Time-bounded memory of already-processed event and file identifiers
// ABOUTME: Lazy eviction on every call; tokio Instant so tests can drive the clock

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Default retention window for processed identifiers
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Remembers identifiers for a fixed retention window.
///
/// Two independent instances are used by the relay: one keyed on event
/// identifiers, one on attachment identifiers, so an event and a file that
/// share a value never collide.
#[derive(Debug)]
pub struct DedupCache {
    name: &'static str,
    retention: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(name: &'static str, retention: Duration) -> Self {
        Self {
            name,
            retention,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Cache for whole-event identifiers
    pub fn for_events(retention: Duration) -> Self {
        Self::new("events", retention)
    }

    /// Cache for attachment identifiers
    pub fn for_files(retention: Duration) -> Self {
        Self::new("files", retention)
    }

    /// Returns true (state unchanged) if `id` was recorded within the
    /// retention window; otherwise records it now and returns false.
    pub fn seen_or_record(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.swept(now);
        if seen.contains_key(id) {
            return true;
        }
        seen.insert(id.to_string(), now);
        false
    }

    /// Whether `id` was recorded within the retention window, without recording it
    pub fn contains(&self, id: &str) -> bool {
        self.swept(Instant::now()).contains_key(id)
    }

    fn swept(&self, now: Instant) -> MutexGuard<'_, HashMap<String, Instant>> {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let retention = self.retention;
        let before = seen.len();
        seen.retain(|_, recorded| now.duration_since(*recorded) < retention);
        let evicted = before - seen.len();
        if evicted > 0 {
            tracing::debug!(cache = self.name, evicted, "Evicted expired identifiers");
        }
        seen
    }

    /// Number of identifiers currently retained (expired entries may linger
    /// until the next call)
    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_sighting_records() {
        let cache = DedupCache::for_events(DEFAULT_RETENTION);
        assert!(!cache.seen_or_record("Ev1"));
        assert!(cache.seen_or_record("Ev1"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_does_not_refresh_timestamp() {
        let cache = DedupCache::for_events(Duration::from_secs(300));
        assert!(!cache.seen_or_record("Ev1"));

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(cache.seen_or_record("Ev1"));

        // 301s after the first sighting: expired even though it was seen at 200s
        tokio::time::advance(Duration::from_secs(101)).await;
        assert!(!cache.seen_or_record("Ev1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_after_retention() {
        let cache = DedupCache::for_events(DEFAULT_RETENTION);
        assert!(!cache.seen_or_record("Ev1"));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.seen_or_record("Ev1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.seen_or_record("Ev1"), "expired id must be treated as unseen");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_other_expired_entries() {
        let cache = DedupCache::for_files(DEFAULT_RETENTION);
        cache.seen_or_record("F1");
        cache.seen_or_record("F2");
        tokio::time::advance(Duration::from_secs(301)).await;

        cache.seen_or_record("F3");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contains_does_not_record() {
        let cache = DedupCache::for_files(DEFAULT_RETENTION);
        assert!(!cache.contains("F1"));
        assert!(!cache.seen_or_record("F1"), "contains must leave the id unrecorded");
        assert!(cache.contains("F1"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!cache.contains("F1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_instances() {
        let events = DedupCache::for_events(DEFAULT_RETENTION);
        let files = DedupCache::for_files(DEFAULT_RETENTION);
        assert!(!events.seen_or_record("12345"));
        assert!(!files.seen_or_record("12345"), "file cache must not see event ids");
    }
}
