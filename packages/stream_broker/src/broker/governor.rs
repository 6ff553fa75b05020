//! Resource Governor
//!
//! Keeps a process with no natural shutdown point bounded: a cap on live
//! upstreams, a cap on tracked sessions, and an idle timeout. A session with
//! an attached upstream is never an eviction candidate.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::state::SessionStore;
use crate::error::StartRejection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_concurrent_streams: usize,
    pub max_tracked_sessions: usize,
    pub idle_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 10,
            max_tracked_sessions: 20,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    limits: Limits,
}

impl ResourceGovernor {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// May `session_id` open an upstream? Its own live stream (a restart)
    /// does not count against the cap. Never mutates anything.
    pub fn admit(&self, store: &SessionStore, session_id: &str) -> Result<(), StartRejection> {
        let restarting = store.peek(session_id).is_some_and(|s| s.is_streaming());
        let active = store.streaming_count() - usize::from(restarting);
        if active >= self.limits.max_concurrent_streams {
            return Err(StartRejection::ConcurrencyLimit {
                active,
                max: self.limits.max_concurrent_streams,
            });
        }
        Ok(())
    }

    /// Evict every non-streaming session idle for longer than the timeout.
    pub fn sweep_idle(&self, store: &mut SessionStore, now: Instant) -> Vec<String> {
        let mut expired: Vec<String> = store
            .iter()
            .filter(|(_, state)| {
                !state.is_streaming()
                    && now.saturating_duration_since(state.last_activity) > self.limits.idle_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for id in &expired {
            store.evict(id);
        }
        if !expired.is_empty() {
            info!("evicted {} idle session(s)", expired.len());
        }
        expired
    }

    /// Evict least-recently-active non-streaming sessions until the store is
    /// back at the cap, or nothing evictable is left.
    pub fn sweep_over_capacity(&self, store: &mut SessionStore) -> Vec<String> {
        let excess = store.len().saturating_sub(self.limits.max_tracked_sessions);
        if excess == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(Instant, String)> = store
            .iter()
            .filter(|(_, state)| !state.is_streaming())
            .map(|(id, state)| (state.last_activity, id.clone()))
            .collect();
        candidates.sort();

        let evicted: Vec<String> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect();
        for id in &evicted {
            store.evict(id);
        }
        if !evicted.is_empty() {
            info!(
                tracked = store.len(),
                max = self.limits.max_tracked_sessions,
                "evicted {} session(s) over the tracking cap",
                evicted.len()
            );
        }
        evicted
    }
}
