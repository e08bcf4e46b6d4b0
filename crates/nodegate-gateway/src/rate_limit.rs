//! Per-IP limiter for node upgrade attempts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window of upgrade attempts per source IP.
pub struct RateLimiter {
    max_attempts_per_ip: u32,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    attempts: HashMap<IpAddr, Vec<Instant>>,
    last_prune: Instant,
}

impl RateLimiter {
    pub fn new(max_attempts_per_ip: u32) -> Self {
        Self {
            max_attempts_per_ip,
            state: Mutex::new(LimiterState {
                attempts: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if an upgrade attempt from this IP should be allowed.
    /// Returns true if allowed, false if rate limited.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(WINDOW).unwrap_or(now);
        let mut state = self.lock();

        // Drop idle IPs once per window
        if now.duration_since(state.last_prune) >= WINDOW {
            state.attempts.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            state.last_prune = now;
            debug!(entries = state.attempts.len(), "Rate limiter cleanup");
        }

        let timestamps = state.attempts.entry(ip).or_default();
        timestamps.retain(|t| *t > cutoff);

        if timestamps.len() >= self.max_attempts_per_ip as usize {
            warn!(%ip, count = timestamps.len(), limit = self.max_attempts_per_ip,
                "Rate limited: too many upgrade attempts from IP");
            return false;
        }

        timestamps.push(now);
        true
    }

    /// Number of IPs currently tracked.
    pub fn tracked_ips(&self) -> usize {
        self.lock().attempts.len()
    }
}
