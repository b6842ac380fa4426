//! Prometheus metrics collection for slroomd.
//!
//! Metrics live in `OnceLock` statics and are registered by [`init`]. Every
//! recording helper is a no-op until then, so library users and tests that
//! never call `init` pay nothing.
//!
//! - `room_input_events_total{kind,outcome}` - Input events by kind and outcome
//! - `room_state_resolutions_total{path}` - Resolution runs (fast or full)
//! - `room_state_resolution_duration_seconds` - Full resolution latency
//! - `room_operation_duration_seconds{operation}` - Performer/query latency
//! - `room_perform_errors_total{operation,error}` - Errors by kind
//! - `room_active_actors` - Per-room input actors currently running

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Input events by kind (new, outlier, old) and outcome.
pub static INPUT_EVENTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Events stored as rejected.
pub static REJECTED_EVENTS: OnceLock<IntCounter> = OnceLock::new();

/// State resolution runs by path (fast, full).
pub static STATE_RESOLUTIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Output records appended to the durable log.
pub static OUTPUT_EVENTS: OnceLock<IntCounter> = OnceLock::new();

/// Missing-event fetches by outcome.
pub static MISSING_EVENT_FETCHES: OnceLock<IntCounterVec> = OnceLock::new();

/// Errors by operation and error kind.
pub static PERFORM_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound events denied by a room ACL.
pub static ACL_DENIED: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Gauges and histograms
// ========================================================================

/// Per-room input actors currently running.
pub static ACTIVE_ROOM_ACTORS: OnceLock<IntGauge> = OnceLock::new();

/// Full state resolution latency.
pub static RESOLUTION_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Operation latency by operation name.
pub static OPERATION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at server startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(INPUT_EVENTS, IntCounterVec::new(Opts::new("room_input_events_total", "Input events by kind and outcome"), &["kind", "outcome"]));
    register!(REJECTED_EVENTS, IntCounter::new("room_rejected_events_total", "Events stored as rejected"));
    register!(STATE_RESOLUTIONS, IntCounterVec::new(Opts::new("room_state_resolutions_total", "State resolution runs"), &["path"]));
    register!(OUTPUT_EVENTS, IntCounter::new("room_output_events_total", "Output records appended"));
    register!(MISSING_EVENT_FETCHES, IntCounterVec::new(Opts::new("room_missing_event_fetches_total", "Missing event fetches by outcome"), &["outcome"]));
    register!(PERFORM_ERRORS, IntCounterVec::new(Opts::new("room_perform_errors_total", "Errors by operation and kind"), &["operation", "error"]));
    register!(ACL_DENIED, IntCounter::new("room_acl_denied_total", "Inbound events denied by room ACLs"));
    register!(ACTIVE_ROOM_ACTORS, IntGauge::new("room_active_actors", "Per-room input actors running"));
    register!(RESOLUTION_LATENCY, Histogram::with_opts(
        HistogramOpts::new("room_state_resolution_duration_seconds", "Full state resolution latency")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])));
    register!(OPERATION_LATENCY, HistogramVec::new(
        HistogramOpts::new("room_operation_duration_seconds", "Operation latency by name")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["operation"]));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for room metric updates
// ============================================================================

/// Record an input event outcome.
#[inline]
pub fn record_input(kind: &str, outcome: &str) {
    if let Some(c) = INPUT_EVENTS.get() {
        c.with_label_values(&[kind, outcome]).inc();
    }
    if outcome == "rejected"
        && let Some(c) = REJECTED_EVENTS.get()
    {
        c.inc();
    }
}

/// Record a state resolution run. `duration_secs` is only observed for full runs.
#[inline]
pub fn record_resolution(fast_path: bool, duration_secs: f64) {
    if let Some(c) = STATE_RESOLUTIONS.get() {
        c.with_label_values(&[if fast_path { "fast" } else { "full" }]).inc();
    }
    if !fast_path && let Some(h) = RESOLUTION_LATENCY.get() {
        h.observe(duration_secs);
    }
}

#[inline]
pub fn record_output(count: usize) {
    if let Some(c) = OUTPUT_EVENTS.get() {
        c.inc_by(count as u64);
    }
}

#[inline]
pub fn record_missing_fetch(outcome: &str) {
    if let Some(c) = MISSING_EVENT_FETCHES.get() {
        c.with_label_values(&[outcome]).inc();
    }
}

/// Record an operation error.
#[inline]
pub fn record_error(operation: &str, error: &str) {
    if let Some(c) = PERFORM_ERRORS.get() {
        c.with_label_values(&[operation, error]).inc();
    }
}

#[inline]
pub fn record_acl_denied() {
    if let Some(c) = ACL_DENIED.get() {
        c.inc();
    }
}

/// Record an operation's latency.
#[inline]
pub fn record_operation(operation: &str, duration_secs: f64) {
    if let Some(h) = OPERATION_LATENCY.get() {
        h.with_label_values(&[operation]).observe(duration_secs);
    }
}

#[inline]
pub fn actor_started() {
    if let Some(g) = ACTIVE_ROOM_ACTORS.get() {
        g.inc();
    }
}

#[inline]
pub fn actor_stopped() {
    if let Some(g) = ACTIVE_ROOM_ACTORS.get() {
        g.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_lifecycle() {
        init();

        record_input("new", "accepted");
        record_input("new", "rejected");
        record_resolution(false, 0.002);
        record_operation("perform_join", 0.01);

        let output = gather_metrics();
        assert!(output.contains("room_input_events_total"));
        assert!(output.contains("room_rejected_events_total"));
    }
}
