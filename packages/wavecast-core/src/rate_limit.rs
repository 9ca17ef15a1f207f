//! Per-IP sliding-window rate limiting.
//!
//! One [`RateLimiter`] per protected surface; all of them grouped in
//! [`RateLimitTables`] with a shared sweeper that deletes empty buckets so
//! the maps never grow with dead IPs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol_constants::{
    CONNECT_LIMIT, CONNECT_LIMIT_WINDOW_SECS, IDENTIFY_LIMIT, IDENTIFY_WINDOW_SECS,
    INTEGRATION_TEST_LIMIT, INTEGRATION_TEST_WINDOW_SECS, LOGIN_LIMIT, LOGIN_LIMIT_WINDOW_SECS,
    RATE_LIMIT_SWEEP_INTERVAL_SECS,
};

/// Sliding-window counter keyed by peer IP.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt from `ip` and reports whether it is allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        let bucket = hits.entry(ip).or_default();
        bucket.retain(|t| now.duration_since(*t) < self.window);
        if bucket.len() >= self.max as usize {
            return false;
        }
        bucket.push(now);
        true
    }

    /// Drops expired entries and empty buckets.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut hits = self.hits.lock();
        hits.retain(|_, bucket| {
            bucket.retain(|t| now.duration_since(*t) < self.window);
            !bucket.is_empty()
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.hits.lock().len()
    }
}

/// All per-IP tables of the server.
pub struct RateLimitTables {
    /// Signaling connection attempts.
    pub connects: RateLimiter,
    pub login: RateLimiter,
    pub integration_test: RateLimiter,
    pub identify: RateLimiter,
}

impl RateLimitTables {
    pub fn new() -> Self {
        Self {
            connects: RateLimiter::new(
                CONNECT_LIMIT,
                Duration::from_secs(CONNECT_LIMIT_WINDOW_SECS),
            ),
            login: RateLimiter::new(LOGIN_LIMIT, Duration::from_secs(LOGIN_LIMIT_WINDOW_SECS)),
            integration_test: RateLimiter::new(
                INTEGRATION_TEST_LIMIT,
                Duration::from_secs(INTEGRATION_TEST_WINDOW_SECS),
            ),
            identify: RateLimiter::new(IDENTIFY_LIMIT, Duration::from_secs(IDENTIFY_WINDOW_SECS)),
        }
    }

    /// Spawns the periodic sweep of every table.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tables = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(RATE_LIMIT_SWEEP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tables.connects.sweep();
                tables.login.sweep();
                tables.integration_test.sweep();
                tables.identify.sweep();
            }
        })
    }
}

impl Default for RateLimitTables {
    fn default() -> Self {
        Self::new()
    }
}
