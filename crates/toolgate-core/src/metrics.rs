//! Global atomic counters for toolgate.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when an executor shuts down).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters with no allocation or locking.
pub struct Metrics {
    validations: AtomicU64,
    rejections: AtomicU64,
    executions: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    sessions_provisioned: AtomicU64,
    sessions_reaped: AtomicU64,
    audit_persist_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            validations: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            sessions_provisioned: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            audit_persist_failures: AtomicU64::new(0),
        }
    }

    /// A tool call went through policy validation.
    pub fn inc_validations(&self) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "validations", "counter incremented");
    }

    /// A tool call was rejected by policy.
    pub fn inc_rejections(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rejections", "counter incremented");
    }

    /// A tool call reached the sandbox.
    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    pub fn inc_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cancellations", "counter incremented");
    }

    pub fn inc_sessions_provisioned(&self) {
        self.sessions_provisioned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_provisioned", "counter incremented");
    }

    /// An idle session was closed by the background reaper.
    pub fn inc_sessions_reaped(&self) {
        self.sessions_reaped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_reaped", "counter incremented");
    }

    pub fn inc_audit_persist_failures(&self) {
        self.audit_persist_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "audit_persist_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            validations = self.validations(),
            rejections = self.rejections(),
            executions = self.executions(),
            timeouts = self.timeouts(),
            cancellations = self.cancellations(),
            sessions_provisioned = self.sessions_provisioned(),
            sessions_reaped = self.sessions_reaped(),
            audit_persist_failures = self.audit_persist_failures(),
        );
    }

    pub fn validations(&self) -> u64 {
        self.validations.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    pub fn sessions_provisioned(&self) -> u64 {
        self.sessions_provisioned.load(Ordering::Relaxed)
    }

    pub fn sessions_reaped(&self) -> u64 {
        self.sessions_reaped.load(Ordering::Relaxed)
    }

    pub fn audit_persist_failures(&self) -> u64 {
        self.audit_persist_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.validations,
            &self.rejections,
            &self.executions,
            &self.timeouts,
            &self.cancellations,
            &self.sessions_provisioned,
            &self.sessions_reaped,
            &self.audit_persist_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
