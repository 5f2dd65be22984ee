//! Prometheus-based metrics module
//!
//! Counters for envelope traffic and gauges for live protocol instances.
//! Metrics are registered on the crate registry by `init_metrics`; an
//! embedding daemon can gather them from `REGISTRY`.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Envelope Metrics ===

    /// Envelopes fully written to a peer
    pub static ref ENVELOPES_SENT: IntCounter = IntCounter::new(
        "oppnet_envelopes_sent_total",
        "Total number of envelopes delivered to a peer"
    ).unwrap();

    /// Envelope sends reported as failed
    pub static ref ENVELOPES_FAILED: IntCounter = IntCounter::new(
        "oppnet_envelopes_failed_total",
        "Total number of envelope sends that failed"
    ).unwrap();

    /// Envelopes decoded from a peer
    pub static ref ENVELOPES_RECEIVED: IntCounter = IntCounter::new(
        "oppnet_envelopes_received_total",
        "Total number of envelopes received"
    ).unwrap();

    /// Headers that failed to decode
    pub static ref DECODE_FAILURES: IntCounter = IntCounter::new(
        "oppnet_decode_failures_total",
        "Total number of envelope decode failures"
    ).unwrap();

    // === Traffic Metrics ===

    /// Wire bytes written, per protocol kind
    pub static ref BYTES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("oppnet_bytes_sent_total", "Envelope bytes sent per protocol kind"),
        &["kind"]
    ).unwrap();

    /// Wire bytes read, per protocol kind
    pub static ref BYTES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("oppnet_bytes_received_total", "Envelope bytes received per protocol kind"),
        &["kind"]
    ).unwrap();

    // === Protocol Metrics ===

    /// Registered protocol instances per kind
    pub static ref PROTOCOLS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("oppnet_protocols_active", "Registered protocol instances per kind"),
        &["kind"]
    ).unwrap();

    /// Instances abandoned after the shutdown grace period
    pub static ref PROTOCOLS_FORCED_DETACH: IntCounter = IntCounter::new(
        "oppnet_protocols_forced_detach_total",
        "Protocol instances forcibly detached at shutdown"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    // Envelope metrics
    REGISTRY.register(Box::new(ENVELOPES_SENT.clone())).ok();
    REGISTRY.register(Box::new(ENVELOPES_FAILED.clone())).ok();
    REGISTRY.register(Box::new(ENVELOPES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(DECODE_FAILURES.clone())).ok();

    // Traffic metrics
    REGISTRY.register(Box::new(BYTES_SENT.clone())).ok();
    REGISTRY.register(Box::new(BYTES_RECEIVED.clone())).ok();

    // Protocol metrics
    REGISTRY.register(Box::new(PROTOCOLS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(PROTOCOLS_FORCED_DETACH.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
