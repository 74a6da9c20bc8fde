//! Relay metrics for observability
//!
//! Plain atomic counters, read out as a serializable snapshot.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently open websocket connections
    pub active_connections: AtomicU64,
    /// Total connections since start
    pub total_connections: AtomicU64,

    // Session metrics
    pub active_sessions: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub sessions_closed: AtomicU64,
    /// Sessions that failed during login or handshake
    pub session_failures: AtomicU64,

    // Comment metrics
    pub comments_received: AtomicU64,
    pub comments_delivered: AtomicU64,
    /// Deliveries skipped because a subscriber queue was full
    pub comments_dropped: AtomicU64,
    /// Subscribers removed because they went away
    pub subscribers_removed: AtomicU64,

    // Post metrics
    pub posts_accepted: AtomicU64,
    pub posts_failed: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.session_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn comment_received(&self) {
        self.comments_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn comment_delivered(&self) {
        self.comments_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn comment_dropped(&self) {
        self.comments_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_removed(&self) {
        self.subscribers_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn post_accepted(&self) {
        self.posts_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn post_failed(&self) {
        self.posts_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                opened: self.sessions_opened.load(Ordering::Relaxed),
                closed: self.sessions_closed.load(Ordering::Relaxed),
                failed: self.session_failures.load(Ordering::Relaxed),
            },
            comments: CommentMetrics {
                received: self.comments_received.load(Ordering::Relaxed),
                delivered: self.comments_delivered.load(Ordering::Relaxed),
                dropped: self.comments_dropped.load(Ordering::Relaxed),
                subscribers_removed: self.subscribers_removed.load(Ordering::Relaxed),
            },
            posts: PostMetrics {
                accepted: self.posts_accepted.load(Ordering::Relaxed),
                failed: self.posts_failed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub comments: CommentMetrics,
    pub posts: PostMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub opened: u64,
    pub closed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentMetrics {
    pub received: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers_removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMetrics {
    pub accepted: u64,
    pub failed: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = RelayMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_session_tracking() {
        let metrics = RelayMetrics::new();

        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed();
        metrics.session_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.active, 1);
        assert_eq!(snapshot.sessions.opened, 2);
        assert_eq!(snapshot.sessions.closed, 1);
        assert_eq!(snapshot.sessions.failed, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RelayMetrics::new();
        metrics.comment_received();
        metrics.comment_delivered();
        metrics.comment_delivered();
        metrics.comment_dropped();
        metrics.post_accepted();
        metrics.post_failed();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["comments"]["received"], 1);
        assert_eq!(json["comments"]["delivered"], 2);
        assert_eq!(json["comments"]["dropped"], 1);
        assert_eq!(json["posts"]["accepted"], 1);
        assert_eq!(json["posts"]["failed"], 1);
    }
}
