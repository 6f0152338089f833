//! Rate-limited broadcast fan-out to per-submission, per-contest and global
//! topics (§4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::event::{self, GenericEvent};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

struct RateWindow {
    reset_at: Instant,
    count: u32,
}

/// Owns one broadcast channel per live topic and the per-submission rate
/// limiter state. Topics are created lazily on first publish or subscribe and
/// are never explicitly torn down; an idle topic with no subscribers simply
/// drops its messages (broadcast semantics), so this stays cheap.
pub struct Publisher {
    secret: Vec<u8>,
    topics: DashMap<String, broadcast::Sender<Arc<str>>>,
    rate_limit: u32,
    rate_window: Duration,
    windows: DashMap<i64, RateWindow>,
}

impl Publisher {
    pub fn new(secret: Vec<u8>, rate_limit: u32, rate_window: Duration) -> Self {
        Self {
            secret,
            topics: DashMap::new(),
            rate_limit,
            rate_window,
            windows: DashMap::new(),
        }
    }

    pub fn submission_topic(&self, submission_id: i64) -> String {
        event::submission_topic(&self.secret, submission_id)
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<str>> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn publish_raw(&self, topic: &str, payload: Arc<str>) {
        let sender = self
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        // No subscribers is not an error: the event is simply unobserved.
        let _ = sender.send(payload);
    }

    fn publish_event(&self, topic: &str, name: &str, data: impl Serialize) {
        let payload = match serde_json::to_value(data) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize event payload");
                return;
            }
        };
        let event = GenericEvent {
            topic: name.to_owned(),
            payload,
        };
        match serde_json::to_string(&event) {
            Ok(encoded) => self.publish_raw(topic, Arc::from(encoded.as_str())),
            Err(err) => tracing::warn!(%err, "failed to encode event envelope"),
        }
    }

    /// Publish a coarse, always-delivered event (handshake results, dispatch,
    /// processing, terminal events). Never subject to rate limiting.
    pub fn publish(&self, submission_id: i64, name: &str, data: impl Serialize) {
        let topic = self.submission_topic(submission_id);
        self.publish_event(&topic, name, data);
        self.publish_event(event::GLOBAL_SUBMISSIONS_TOPIC, name, serde_json::json!({ "id": submission_id }));
    }

    /// Publish a terminal event: bypasses the rate limiter unconditionally
    /// (§4.5: "the final grading-end is never dropped") and clears that
    /// submission's rate-limit window since no further events follow.
    pub fn publish_terminal(&self, submission_id: i64, name: &str, data: impl Serialize) {
        self.publish(submission_id, name, data);
        self.windows.remove(&submission_id);
    }

    /// Publish a per-testcase event subject to the §4.5 rate limit: at most
    /// `rate_limit` emissions per `rate_window` per submission; overflow is
    /// dropped silently (the row itself is still persisted by the caller).
    pub fn publish_testcase(&self, submission_id: i64, name: &str, data: impl Serialize) {
        if !self.allow(submission_id) {
            return;
        }
        let topic = self.submission_topic(submission_id);
        self.publish_event(&topic, name, data);
    }

    /// Publish to a contest-wide topic (coarse participation/ranking changes).
    pub fn publish_contest(&self, contest_id: i64, name: &str, data: impl Serialize) {
        let topic = event::contest_topic(contest_id);
        self.publish_event(&topic, name, data);
    }

    fn allow(&self, submission_id: i64) -> bool {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(submission_id)
            .or_insert_with(|| RateWindow {
                reset_at: now + self.rate_window,
                count: 0,
            });
        if now >= window.reset_at {
            window.reset_at = now + self.rate_window;
            window.count = 0;
        }
        if window.count >= self.rate_limit {
            return false;
        }
        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_caps_within_window_and_resets_after() {
        let publisher = Publisher::new(b"secret".to_vec(), 5, Duration::from_millis(50));
        let mut allowed = 0;
        for _ in 0..20 {
            if publisher.allow(99) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);

        std::thread::sleep(Duration::from_millis(60));
        assert!(publisher.allow(99));
    }

    #[test]
    fn terminal_publish_clears_window() {
        let publisher = Publisher::new(b"secret".to_vec(), 1, Duration::from_secs(1));
        assert!(publisher.allow(7));
        assert!(!publisher.allow(7));
        publisher.publish_terminal(7, "grading-end", serde_json::json!({}));
        assert!(publisher.allow(7));
    }
}
