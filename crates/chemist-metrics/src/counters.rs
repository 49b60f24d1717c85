//! Fleet-wide counters and their Prometheus rendering.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the control plane's externally visible activity.
#[derive(Debug, Default)]
pub struct ControlMetrics {
    lifecycle_events: AtomicU64,
    reshardings: AtomicU64,
    investigations: AtomicU64,
    confirmed_losses: AtomicU64,
    new_keys: AtomicU64,
    parse_failures: AtomicU64,
}

impl ControlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lifecycle_event(&self) {
        self.lifecycle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resharding(&self) {
        self.reshardings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_investigation(&self) {
        self.investigations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirmed_loss(&self) {
        self.confirmed_losses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_key(&self) {
        self.new_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lifecycle_events(&self) -> u64 {
        self.lifecycle_events.load(Ordering::Relaxed)
    }

    pub fn reshardings(&self) -> u64 {
        self.reshardings.load(Ordering::Relaxed)
    }

    pub fn investigations(&self) -> u64 {
        self.investigations.load(Ordering::Relaxed)
    }

    pub fn confirmed_losses(&self) -> u64 {
        self.confirmed_losses.load(Ordering::Relaxed)
    }

    pub fn new_keys(&self) -> u64 {
        self.new_keys.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    /// Render all counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in [
            (
                "chemist_lifecycle_events_total",
                "Cloud lifecycle messages processed.",
                self.lifecycle_events(),
            ),
            (
                "chemist_reshardings_total",
                "Distribution deltas pushed to flasks.",
                self.reshardings(),
            ),
            (
                "chemist_investigations_total",
                "Flask investigations started.",
                self.investigations(),
            ),
            (
                "chemist_confirmed_losses_total",
                "Investigations that exhausted their probes.",
                self.confirmed_losses(),
            ),
            (
                "chemist_new_keys_total",
                "Newly discovered telemetry keys.",
                self.new_keys(),
            ),
            (
                "chemist_parse_failures_total",
                "Unparseable lifecycle messages dropped.",
                self.parse_failures(),
            ),
        ] {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {value}\n"));
        }
        out
    }
}
