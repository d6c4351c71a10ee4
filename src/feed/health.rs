// =============================================================================
// Feed health registry — per-feed last-success timestamps and staleness
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

/// Health record for one named feed.
#[derive(Debug, Clone)]
pub struct FeedStatus {
    pub last_success_at: Option<Instant>,
    pub threshold: Duration,
    pub last_error: Option<String>,
}

/// Serialisable view for the ops snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatusView {
    pub feed: String,
    pub age_secs: Option<u64>,
    pub threshold_secs: u64,
    pub stale: bool,
    pub last_error: Option<String>,
}

/// Registry of feed freshness. A feed is stale when it has never succeeded
/// or its last success is older than its threshold.
#[derive(Debug, Default)]
pub struct FeedHealth {
    feeds: RwLock<HashMap<String, FeedStatus>>,
}

impl FeedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feed with its staleness threshold. Idempotent; the
    /// threshold of an existing feed is updated in place.
    pub fn register(&self, feed: &str, threshold: Duration) {
        let mut feeds = self.feeds.write();
        feeds
            .entry(feed.to_string())
            .and_modify(|s| s.threshold = threshold)
            .or_insert(FeedStatus {
                last_success_at: None,
                threshold,
                last_error: None,
            });
    }

    pub fn mark_success(&self, feed: &str) {
        let mut feeds = self.feeds.write();
        if let Some(status) = feeds.get_mut(feed) {
            status.last_success_at = Some(Instant::now());
            status.last_error = None;
        } else {
            debug!(feed, "mark_success on unregistered feed");
        }
    }

    pub fn mark_error(&self, feed: &str, error: impl Into<String>) {
        let mut feeds = self.feeds.write();
        if let Some(status) = feeds.get_mut(feed) {
            status.last_error = Some(error.into());
        }
    }

    /// Staleness predicate. Unknown feeds are stale.
    pub fn is_stale(&self, feed: &str) -> bool {
        let feeds = self.feeds.read();
        match feeds.get(feed) {
            Some(status) => match status.last_success_at {
                Some(at) => at.elapsed() > status.threshold,
                None => true,
            },
            None => true,
        }
    }

    pub fn last_error(&self, feed: &str) -> Option<String> {
        self.feeds.read().get(feed).and_then(|s| s.last_error.clone())
    }

    /// Snapshot for the ops API.
    pub fn snapshot(&self) -> Vec<FeedStatusView> {
        let feeds = self.feeds.read();
        let mut views: Vec<FeedStatusView> = feeds
            .iter()
            .map(|(name, status)| FeedStatusView {
                feed: name.clone(),
                age_secs: status.last_success_at.map(|t| t.elapsed().as_secs()),
                threshold_secs: status.threshold.as_secs(),
                stale: match status.last_success_at {
                    Some(at) => at.elapsed() > status.threshold,
                    None => true,
                },
                last_error: status.last_error.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.feed.cmp(&b.feed));
        views
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_feed_is_stale() {
        let health = FeedHealth::new();
        assert!(health.is_stale("ticks"));
    }

    #[test]
    fn registered_but_never_succeeded_is_stale() {
        let health = FeedHealth::new();
        health.register("ticks", Duration::from_secs(30));
        assert!(health.is_stale("ticks"));
    }

    #[test]
    fn success_clears_staleness_and_error() {
        let health = FeedHealth::new();
        health.register("ticks", Duration::from_secs(30));
        health.mark_error("ticks", "boom");
        assert_eq!(health.last_error("ticks"), Some("boom".to_string()));

        health.mark_success("ticks");
        assert!(!health.is_stale("ticks"));
        assert_eq!(health.last_error("ticks"), None);
    }

    #[test]
    fn zero_threshold_goes_stale_immediately() {
        let health = FeedHealth::new();
        health.register("ticks", Duration::from_secs(0));
        health.mark_success("ticks");
        std::thread::sleep(Duration::from_millis(5));
        assert!(health.is_stale("ticks"));
    }
}
