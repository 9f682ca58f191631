//! Per-identity fixed-window admission control.
//!
//! All windows live behind one mutex, so concurrent checks for the same
//! identity are serialized and can never jointly exceed the limit. Windows
//! idle for `retention_windows` window lengths are evicted on a lazy sweep,
//! which bounds memory by the number of recently active identities.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Counter state for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub window_start: Instant,
    pub count: u32,
}

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Empty when allowed.
    pub reason: String,
    /// Time until the current window ends (zero when allowed).
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Windows {
    by_identity: HashMap<String, RateLimitWindow>,
    last_sweep: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    retention: Duration,
    state: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self::with_retention(max_requests, window, 2)
    }

    /// `retention_windows` is clamped to at least one window.
    pub fn with_retention(max_requests: u32, window: Duration, retention_windows: u32) -> Self {
        Self {
            max_requests,
            window,
            retention: window.saturating_mul(retention_windows.max(1)),
            state: Mutex::new(Windows {
                by_identity: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::with_retention(
            config.max_requests,
            Duration::from_secs(config.window_seconds),
            config.retention_windows,
        )
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request for `identity` and decide whether it is admitted.
    pub fn check(&self, identity: &str) -> RateDecision {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if now.duration_since(state.last_sweep) >= self.window {
            let retention = self.retention;
            state
                .by_identity
                .retain(|_, w| now.duration_since(w.window_start) < retention);
            state.last_sweep = now;
        }

        let window = self.window;
        let entry = state
            .by_identity
            .entry(identity.to_string())
            .or_insert(RateLimitWindow {
                window_start: now,
                count: 0,
            });

        if now.duration_since(entry.window_start) >= window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);

        if entry.count <= self.max_requests {
            return RateDecision {
                allowed: true,
                reason: String::new(),
                retry_after: Duration::ZERO,
            };
        }

        let retry_after = (entry.window_start + window).saturating_duration_since(now);
        RateDecision {
            allowed: false,
            reason: format!(
                "limit of {} requests per {}s reached for {}, retry in {:.1}s",
                self.max_requests,
                window.as_secs(),
                identity,
                retry_after.as_secs_f64()
            ),
            retry_after,
        }
    }

    /// Current window for `identity`, if one is retained.
    pub fn window_for(&self, identity: &str) -> Option<RateLimitWindow> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.by_identity.get(identity).copied()
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.by_identity.len()
    }

    /// Evict windows idle beyond the retention bound. Returns how many went.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.by_identity.len();
        let retention = self.retention;
        state
            .by_identity
            .retain(|_, w| now.duration_since(w.window_start) < retention);
        state.last_sweep = now;
        before - state.by_identity.len()
    }
}
