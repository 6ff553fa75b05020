//! Broker metrics for observability
//!
//! Lock-free counters updated from the broker task, the upstream adapters and
//! the WebSocket handlers; read by the `/health` and `/metrics` endpoints.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide metrics
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    // Subscriber metrics
    /// Currently connected subscriber sockets
    pub active_subscribers: AtomicU64,
    /// Total subscribers since start
    pub total_subscribers: AtomicU64,
    /// Subscribers removed because a send failed or heartbeats went unanswered
    pub subscribers_pruned: AtomicU64,

    // Stream metrics
    pub streams_started: AtomicU64,
    /// START requests refused by the concurrency cap
    pub streams_rejected: AtomicU64,
    pub streams_completed: AtomicU64,
    pub streams_aborted: AtomicU64,
    pub streams_failed: AtomicU64,

    // Frame metrics
    pub frames_processed: AtomicU64,
    /// Malformed or unknown frames dropped by the adapter
    pub frames_skipped: AtomicU64,

    // Eviction metrics
    pub sessions_evicted_idle: AtomicU64,
    pub sessions_evicted_capacity: AtomicU64,

    start_time: Option<Instant>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn subscriber_connected(&self) {
        self.active_subscribers.fetch_add(1, Ordering::Relaxed);
        self.total_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_disconnected(&self) {
        self.active_subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscribers_pruned(&self, count: usize) {
        self.subscribers_pruned
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_rejected(&self) {
        self.streams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_completed(&self) {
        self.streams_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_aborted(&self) {
        self.streams_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_failed(&self) {
        self.streams_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_evicted_idle(&self, count: usize) {
        self.sessions_evicted_idle
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn sessions_evicted_capacity(&self, count: usize) {
        self.sessions_evicted_capacity
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            subscribers: SubscriberMetrics {
                active: self.active_subscribers.load(Ordering::Relaxed),
                total: self.total_subscribers.load(Ordering::Relaxed),
                pruned: self.subscribers_pruned.load(Ordering::Relaxed),
            },
            streams: StreamMetrics {
                started: self.streams_started.load(Ordering::Relaxed),
                rejected: self.streams_rejected.load(Ordering::Relaxed),
                completed: self.streams_completed.load(Ordering::Relaxed),
                aborted: self.streams_aborted.load(Ordering::Relaxed),
                failed: self.streams_failed.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                processed: self.frames_processed.load(Ordering::Relaxed),
                skipped: self.frames_skipped.load(Ordering::Relaxed),
            },
            evictions: EvictionMetrics {
                idle: self.sessions_evicted_idle.load(Ordering::Relaxed),
                capacity: self.sessions_evicted_capacity.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub subscribers: SubscriberMetrics,
    pub streams: StreamMetrics,
    pub frames: FrameMetrics,
    pub evictions: EvictionMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberMetrics {
    pub active: u64,
    pub total: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub started: u64,
    pub rejected: u64,
    pub completed: u64,
    pub aborted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub processed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionMetrics {
    pub idle: u64,
    pub capacity: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub tracked_sessions: usize,
    pub active_streams: usize,
    pub subscribers: usize,
    pub uptime_secs: u64,
}
