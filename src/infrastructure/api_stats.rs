//! Process-scoped API call statistics.
//!
//! Thread-safe aggregate incremented by every provider call; readable as a
//! snapshot. Created at startup and handed around as an Arc, not a
//! module-level singleton.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ApiCallStats {
    calls: AtomicU64,
    retries: AtomicU64,
    rate_429s: AtomicU64,
    timeouts: AtomicU64,
    cache_hits: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApiCallStatsSnapshot {
    pub calls: u64,
    pub retries: u64,
    pub rate_429s: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
    pub successes: u64,
    pub failures: u64,
}

impl ApiCallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_429(&self) {
        self.rate_429s.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ApiCallStatsSnapshot {
        ApiCallStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_429s: self.rate_429s.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = ApiCallStats::new();
        stats.record_call();
        stats.record_call();
        stats.record_success();
        stats.record_429();

        let snap = stats.snapshot();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.rate_429s, 1);
        assert_eq!(snap.failures, 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let stats = Arc::new(ApiCallStats::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let stats = stats.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    stats.record_call();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(stats.snapshot().calls, 1600);
    }
}
