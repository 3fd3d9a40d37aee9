//! # Application State Management
//!
//! State shared by every HTTP handler and every WebSocket session.
//!
//! ## Sharing pattern:
//! - **Arc<RwLock<AppConfig>>**: many readers, occasional writer (`PUT /api/v1/config`)
//! - **Arc<RelayMetrics>**: plain atomics, so the hot relay path never takes a lock
//! - **Arc<dyn GenerationApi>**: one HTTP client pool reused by all sessions
//!
//! Sessions share nothing mutable with each other beyond these counters.

use crate::config::AppConfig;
use crate::relay::generation::GenerationApi;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RelayMetrics>,
    pub generation: Arc<dyn GenerationApi>,
    pub start_time: Instant,
}

/// Relay counters since server start.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub sessions_opened: AtomicU64,
    pub sessions_rejected: AtomicU64,
    pub active_sessions: AtomicUsize,
    pub payloads_received: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub chunks_failed: AtomicU64,
    pub rate_limit_retries: AtomicU64,
    pub fragments_forwarded: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`] for JSON responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_rejected: u64,
    pub active_sessions: usize,
    pub payloads_received: u64,
    pub chunks_sent: u64,
    pub chunks_failed: u64,
    pub rate_limit_retries: u64,
    pub fragments_forwarded: u64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            rate_limit_retries: self.rate_limit_retries.load(Ordering::Relaxed),
            fragments_forwarded: self.fragments_forwarded.load(Ordering::Relaxed),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Holds one slot of the concurrent session limit; the slot is released on drop.
#[derive(Debug)]
pub struct SessionPermit {
    metrics: Arc<RelayMetrics>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.metrics.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AppState {
    pub fn new(config: AppConfig, generation: Arc<dyn GenerationApi>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RelayMetrics::default()),
            generation,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released before returning.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration if it validates. Running sessions keep the settings
    /// they were opened with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    /// Reserve a session slot, or `None` when `max_concurrent_sessions` are live.
    pub fn try_open_session(&self) -> Option<SessionPermit> {
        let limit = self.config.read().performance.max_concurrent_sessions;
        let reserved = self
            .metrics
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .is_ok();

        if reserved {
            RelayMetrics::incr(&self.metrics.sessions_opened);
            Some(SessionPermit {
                metrics: self.metrics.clone(),
            })
        } else {
            RelayMetrics::incr(&self.metrics.sessions_rejected);
            None
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::chunker::AudioChunk;
    use crate::relay::generation::GenerationError;
    use crate::relay::messages::ReplyFragment;
    use async_trait::async_trait;

    /// Generation backend that is never reached.
    pub(crate) struct Unreachable;

    #[async_trait]
    impl GenerationApi for Unreachable {
        async fn generate(&self, _: &AudioChunk) -> Result<Vec<ReplyFragment>, GenerationError> {
            Err(GenerationError::Decode("unreachable".into()))
        }
    }

    pub(crate) fn test_state(config: AppConfig) -> AppState {
        AppState::new(config, Arc::new(Unreachable))
    }

    #[test]
    fn test_session_limit_and_release() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 2;
        let state = test_state(config);

        let first = state.try_open_session().expect("first slot");
        let _second = state.try_open_session().expect("second slot");
        assert!(state.try_open_session().is_none());

        drop(first);
        assert!(state.try_open_session().is_some());

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.sessions_opened, 3);
        assert_eq!(snapshot.sessions_rejected, 1);
        assert_eq!(snapshot.active_sessions, 1);
    }

    #[test]
    fn test_update_config_validates() {
        let state = test_state(AppConfig::default());
        let mut bad = state.get_config();
        bad.relay.chunk_size_bytes = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().relay.chunk_size_bytes, 16_000);

        let mut good = state.get_config();
        good.relay.max_attempts = 2;
        assert!(state.update_config(good).is_ok());
        assert_eq!(state.get_config().relay.max_attempts, 2);
    }
}
