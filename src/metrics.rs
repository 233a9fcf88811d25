//! Prometheus metrics collection for replicad.
//!
//! Exposed on an HTTP endpoint (see [`crate::http`]). Recording functions
//! are no-ops until [`init`] has run, so library users and tests that never
//! initialise the registry pay nothing.
//!
//! - `replicad_events_total{kind}` - events applied by the object manager
//! - `replicad_events_dropped_total{reason}` - events the loop refused or failed
//! - `replicad_queue_depth` - units waiting on the object manager queue
//! - `replicad_unit_duration_seconds{site}` - loop and invoker unit latency
//! - `replicad_invocations_total{module,outcome}` - provider method outcomes
//! - `replicad_sessions_active` - live client sessions

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
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

/// Events applied, by kind.
pub static EVENTS_PROCESSED: OnceLock<IntCounterVec> = OnceLock::new();

/// Events dropped by the loop, by reason.
pub static EVENTS_DROPPED: OnceLock<IntCounterVec> = OnceLock::new();

/// Units that exceeded the long-unit threshold.
pub static LONG_UNITS: OnceLock<IntCounterVec> = OnceLock::new();

/// Provider method outcomes.
pub static INVOCATIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Outbound messages a session could not deliver, by reason.
pub static DELIVERIES_DROPPED: OnceLock<IntCounterVec> = OnceLock::new();

/// Sessions started since boot.
pub static SESSIONS_STARTED: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Units waiting on the object manager queue.
pub static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

/// Sessions currently registered with the client manager.
pub static SESSIONS_ACTIVE: OnceLock<IntGauge> = OnceLock::new();

// ========================================================================
// Histograms
// ========================================================================

/// Unit latency by execution site (`loop` or `invoker`).
pub static UNIT_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at server startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            match $init {
                Ok(m) => {
                    if let Err(e) = r.register(Box::new(m.clone())) {
                        tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                    }
                    let _ = $metric.set(m);
                }
                Err(e) => {
                    tracing::error!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                }
            }
        };
    }

    register!(EVENTS_PROCESSED, IntCounterVec::new(Opts::new("replicad_events_total", "Events applied by kind"), &["kind"]));
    register!(EVENTS_DROPPED, IntCounterVec::new(Opts::new("replicad_events_dropped_total", "Events dropped by reason"), &["reason"]));
    register!(LONG_UNITS, IntCounterVec::new(Opts::new("replicad_long_units_total", "Units over the long-unit threshold"), &["site"]));
    register!(INVOCATIONS, IntCounterVec::new(Opts::new("replicad_invocations_total", "Invocation outcomes"), &["module", "outcome"]));
    register!(DELIVERIES_DROPPED, IntCounterVec::new(Opts::new("replicad_deliveries_dropped_total", "Undeliverable outbound messages"), &["reason"]));
    register!(SESSIONS_STARTED, IntCounter::new("replicad_sessions_started_total", "Client sessions started"));
    register!(QUEUE_DEPTH, IntGauge::new("replicad_queue_depth", "Units waiting on the object manager queue"));
    register!(SESSIONS_ACTIVE, IntGauge::new("replicad_sessions_active", "Live client sessions"));
    register!(UNIT_LATENCY, HistogramVec::new(
        HistogramOpts::new("replicad_unit_duration_seconds", "Unit latency by execution site")
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["site"]));
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

/// Record an applied event.
#[inline]
pub fn record_event(kind: &str) {
    if let Some(c) = EVENTS_PROCESSED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record an event the loop dropped.
#[inline]
pub fn record_dropped_event(reason: &str) {
    if let Some(c) = EVENTS_DROPPED.get() {
        c.with_label_values(&[reason]).inc();
    }
}

/// Record a unit's latency, flagging it if it ran long.
#[inline]
pub fn record_unit(site: &str, duration_secs: f64, long: bool) {
    if let Some(h) = UNIT_LATENCY.get() {
        h.with_label_values(&[site]).observe(duration_secs);
    }
    if long && let Some(c) = LONG_UNITS.get() {
        c.with_label_values(&[site]).inc();
    }
}

#[inline]
pub fn set_queue_depth(depth: usize) {
    if let Some(g) = QUEUE_DEPTH.get() {
        g.set(depth as i64);
    }
}

#[inline]
pub fn record_invocation(module: &str, outcome: &str) {
    if let Some(c) = INVOCATIONS.get() {
        c.with_label_values(&[module, outcome]).inc();
    }
}

#[inline]
pub fn record_dropped_delivery(reason: &str) {
    if let Some(c) = DELIVERIES_DROPPED.get() {
        c.with_label_values(&[reason]).inc();
    }
}

#[inline]
pub fn session_started() {
    if let Some(c) = SESSIONS_STARTED.get() {
        c.inc();
    }
    if let Some(g) = SESSIONS_ACTIVE.get() {
        g.inc();
    }
}

#[inline]
pub fn session_ended() {
    if let Some(g) = SESSIONS_ACTIVE.get() {
        g.dec();
    }
}
