//! Lightweight in-process metrics: atomic counters read periodically by
//! tests and an optional `/metrics` debug endpoint. No external sink is
//! wired — observability backends are out of scope.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global lifecycle counters using atomic counters.
///
/// All counters use relaxed ordering: they are approximate gauges read
/// periodically, not used for synchronization.
pub struct SandboxMetrics {
    pub sandboxes_created: AtomicU64,
    pub sandboxes_killed: AtomicU64,
    pub active_sandboxes: AtomicU64,
    pub peak_sandboxes: AtomicU64,

    pub hibernates_ok: AtomicU64,
    pub hibernates_failed: AtomicU64,
    pub wakes_ok: AtomicU64,
    pub wakes_failed: AtomicU64,

    pub reaper_idle_hibernations: AtomicU64,
    pub proxy_inline_wakes: AtomicU64,
    pub proxy_requests: AtomicU64,
    pub proxy_errors: AtomicU64,

    pub pty_sessions_created: AtomicU64,
    pub pty_bytes_in: AtomicU64,
    pub pty_bytes_out: AtomicU64,

    pub workers_registered: AtomicU64,
    pub workers_marked_unhealthy: AtomicU64,
}

impl Default for SandboxMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxMetrics {
    pub const fn new() -> Self {
        Self {
            sandboxes_created: AtomicU64::new(0),
            sandboxes_killed: AtomicU64::new(0),
            active_sandboxes: AtomicU64::new(0),
            peak_sandboxes: AtomicU64::new(0),
            hibernates_ok: AtomicU64::new(0),
            hibernates_failed: AtomicU64::new(0),
            wakes_ok: AtomicU64::new(0),
            wakes_failed: AtomicU64::new(0),
            reaper_idle_hibernations: AtomicU64::new(0),
            proxy_inline_wakes: AtomicU64::new(0),
            proxy_requests: AtomicU64::new(0),
            proxy_errors: AtomicU64::new(0),
            pty_sessions_created: AtomicU64::new(0),
            pty_bytes_in: AtomicU64::new(0),
            pty_bytes_out: AtomicU64::new(0),
            workers_registered: AtomicU64::new(0),
            workers_marked_unhealthy: AtomicU64::new(0),
        }
    }

    pub fn record_sandbox_created(&self) {
        let current = self.active_sandboxes.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_sandboxes.fetch_max(current, Ordering::Relaxed);
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_killed(&self) {
        self.sandboxes_killed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_sandboxes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_hibernate(&self, ok: bool) {
        if ok {
            self.hibernates_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hibernates_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_wake(&self, ok: bool) {
        if ok {
            self.wakes_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.wakes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reaper_idle_hibernation(&self) {
        self.reaper_idle_hibernations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_request(&self) {
        self.proxy_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_error(&self) {
        self.proxy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_inline_wake(&self) {
        self.proxy_inline_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pty_created(&self) {
        self.pty_sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pty_bytes(&self, in_bytes: u64, out_bytes: u64) {
        self.pty_bytes_in.fetch_add(in_bytes, Ordering::Relaxed);
        self.pty_bytes_out.fetch_add(out_bytes, Ordering::Relaxed);
    }

    pub fn record_worker_registered(&self) {
        self.workers_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_unhealthy(&self) {
        self.workers_marked_unhealthy.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters as key-value pairs, for tests and debug endpoints.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("sandboxes_created", self.sandboxes_created.load(Ordering::Relaxed)),
            ("sandboxes_killed", self.sandboxes_killed.load(Ordering::Relaxed)),
            ("active_sandboxes", self.active_sandboxes.load(Ordering::Relaxed)),
            ("peak_sandboxes", self.peak_sandboxes.load(Ordering::Relaxed)),
            ("hibernates_ok", self.hibernates_ok.load(Ordering::Relaxed)),
            ("hibernates_failed", self.hibernates_failed.load(Ordering::Relaxed)),
            ("wakes_ok", self.wakes_ok.load(Ordering::Relaxed)),
            ("wakes_failed", self.wakes_failed.load(Ordering::Relaxed)),
            (
                "reaper_idle_hibernations",
                self.reaper_idle_hibernations.load(Ordering::Relaxed),
            ),
            ("proxy_inline_wakes", self.proxy_inline_wakes.load(Ordering::Relaxed)),
            ("proxy_requests", self.proxy_requests.load(Ordering::Relaxed)),
            ("proxy_errors", self.proxy_errors.load(Ordering::Relaxed)),
            (
                "pty_sessions_created",
                self.pty_sessions_created.load(Ordering::Relaxed),
            ),
            ("pty_bytes_in", self.pty_bytes_in.load(Ordering::Relaxed)),
            ("pty_bytes_out", self.pty_bytes_out.load(Ordering::Relaxed)),
            ("workers_registered", self.workers_registered.load(Ordering::Relaxed)),
            (
                "workers_marked_unhealthy",
                self.workers_marked_unhealthy.load(Ordering::Relaxed),
            ),
        ]
    }
}

static METRICS: SandboxMetrics = SandboxMetrics::new();

/// Access the global metrics tracker.
pub fn metrics() -> &'static SandboxMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_sandboxes_tracks_create_and_kill() {
        let m = SandboxMetrics::new();
        m.record_sandbox_created();
        m.record_sandbox_created();
        m.record_sandbox_killed();
        assert_eq!(m.active_sandboxes.load(Ordering::Relaxed), 1);
        assert_eq!(m.sandboxes_created.load(Ordering::Relaxed), 2);
        assert_eq!(m.sandboxes_killed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn active_sandboxes_never_underflows_past_zero() {
        let m = SandboxMetrics::new();
        m.record_sandbox_killed();
        assert_eq!(m.active_sandboxes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn peak_sandboxes_tracks_the_high_water_mark() {
        let m = SandboxMetrics::new();
        m.record_sandbox_created();
        m.record_sandbox_created();
        m.record_sandbox_killed();
        m.record_sandbox_killed();
        assert_eq!(m.active_sandboxes.load(Ordering::Relaxed), 0);
        assert_eq!(m.peak_sandboxes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let m = SandboxMetrics::new();
        m.record_hibernate(true);
        m.record_hibernate(false);
        m.record_wake(true);
        let snapshot = m.snapshot();
        let get = |key: &str| snapshot.iter().find(|(k, _)| *k == key).map(|(_, v)| *v).unwrap();
        assert_eq!(get("hibernates_ok"), 1);
        assert_eq!(get("hibernates_failed"), 1);
        assert_eq!(get("wakes_ok"), 1);
        assert_eq!(get("wakes_failed"), 0);
    }
}
