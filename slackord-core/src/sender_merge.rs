// ABOUTME: Tracks the most recent sender per channel on each platform
// ABOUTME: Decides when a repeated attribution header can be left off a relayed message

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::traits::Platform;

/// Entries older than this are treated as absent
pub const SENDER_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Consecutive messages closer than this are a burst
pub const BURST_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct LastSender {
    user_id: String,
    observed_at: Instant,
}

/// Last-sender memory shared by both relay directions
#[derive(Debug)]
pub struct SenderMergeTracker {
    expiry: Duration,
    burst: Duration,
    last: Mutex<HashMap<(Platform, String), LastSender>>,
}

impl Default for SenderMergeTracker {
    fn default() -> Self {
        Self::new(SENDER_EXPIRY, BURST_WINDOW)
    }
}

impl SenderMergeTracker {
    pub fn new(expiry: Duration, burst: Duration) -> Self {
        Self {
            expiry,
            burst,
            last: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Platform, String), LastSender>> {
        match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn live_entry(
        &self,
        map: &HashMap<(Platform, String), LastSender>,
        platform: Platform,
        channel_id: &str,
        now: Instant,
    ) -> Option<LastSender> {
        map.get(&(platform, channel_id.to_string()))
            .filter(|entry| now.duration_since(entry.observed_at) < self.expiry)
            .cloned()
    }

    /// Whether the header for `author_id` in `channel_id` on `platform` can
    /// be omitted when relaying into `destination_channel_id` on the other
    /// platform.
    ///
    /// Suppressed only when the previous source message in the channel came
    /// from the same author, and either the last message on the destination
    /// side was posted by the bridge itself or the previous source message
    /// is less than a second old.
    pub fn should_suppress_header(
        &self,
        platform: Platform,
        channel_id: &str,
        author_id: &str,
        destination_channel_id: &str,
        bridge_bot_id: &str,
    ) -> bool {
        let now = Instant::now();
        let map = self.lock();

        let Some(source_last) = self.live_entry(&map, platform, channel_id, now) else {
            return false;
        };
        if source_last.user_id != author_id {
            return false;
        }

        let destination_is_relay = self
            .live_entry(&map, platform.other(), destination_channel_id, now)
            .is_some_and(|dest| dest.user_id == bridge_bot_id);
        let burst = now.duration_since(source_last.observed_at) < self.burst;

        destination_is_relay || burst
    }

    pub fn record(&self, platform: Platform, channel_id: &str, user_id: &str) {
        let mut map = self.lock();
        map.insert(
            (platform, channel_id.to_string()),
            LastSender {
                user_id: user_id.to_string(),
                observed_at: Instant::now(),
            },
        );
    }

    /// Live last sender for a channel
    pub fn last_sender(&self, platform: Platform, channel_id: &str) -> Option<String> {
        let map = self.lock();
        self.live_entry(&map, platform, channel_id, Instant::now())
            .map(|entry| entry.user_id)
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expiry = self.expiry;
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, entry| now.duration_since(entry.observed_at) < expiry);
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "BRIDGE_BOT";

    #[tokio::test(start_paused = true)]
    async fn test_no_history_shows_header() {
        let tracker = SenderMergeTracker::default();
        assert!(!tracker.should_suppress_header(Platform::Slack, "C1", "U1", "D1", BOT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_from_same_author_suppresses() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Slack, "C1", "U1");
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(tracker.should_suppress_header(Platform::Slack, "C1", "U1", "D1", BOT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_same_author_without_relay_shows_header() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Slack, "C1", "U1");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!tracker.should_suppress_header(Platform::Slack, "C1", "U1", "D1", BOT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_relay_suppresses_slow_same_author() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Slack, "C1", "U1");
        // Bridge's own mirror seen on the Discord side
        tracker.record(Platform::Discord, "D1", BOT);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tracker.should_suppress_header(Platform::Slack, "C1", "U1", "D1", BOT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_author_never_suppressed() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Slack, "C1", "U1");
        tracker.record(Platform::Discord, "D1", BOT);
        assert!(!tracker.should_suppress_header(Platform::Slack, "C1", "U2", "D1", BOT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_human_does_not_count_as_relay() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Slack, "C1", "U1");
        tracker.record(Platform::Discord, "D1", "someone_else");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!tracker.should_suppress_header(Platform::Slack, "C1", "U1", "D1", BOT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_absent() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Slack, "C1", "U1");
        tracker.record(Platform::Discord, "D1", BOT);
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(tracker.last_sender(Platform::Slack, "C1").is_none());
        assert!(!tracker.should_suppress_header(Platform::Slack, "C1", "U1", "D1", BOT));
        assert_eq!(tracker.sweep(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_platforms_are_separate_keys() {
        let tracker = SenderMergeTracker::default();
        tracker.record(Platform::Discord, "C1", "U1");
        assert!(tracker.last_sender(Platform::Slack, "C1").is_none());
        assert_eq!(
            tracker.last_sender(Platform::Discord, "C1").as_deref(),
            Some("U1")
        );
    }
}
