//! Stat emission capability.
//!
//! Metric emission is a cross-cutting concern; components receive a
//! [`MetricSink`] instead of reaching into a process-wide registry. The
//! default [`FacadeMetrics`] forwards to the `metrics` facade crate (and
//! from there to whatever exporter the binary installs); [`NoopMetrics`]
//! keeps tests quiet.

use std::sync::Arc;

/// Capability for emitting stat counters and aggregated values.
pub trait MetricSink: Send + Sync + 'static {
    /// Adds `value` to a monotonic counter.
    fn increment(&self, name: &'static str, value: u64);

    /// Records one observation of a value (latency, queue depth, ...).
    fn observe(&self, name: &'static str, value: f64);

    /// Sets a gauge to an absolute value.
    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Shared handle to a metric sink.
pub type SharedMetricSink = Arc<dyn MetricSink>;

/// Sink backed by the `metrics` facade crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricSink for FacadeMetrics {
    fn increment(&self, name: &'static str, value: u64) {
        metrics::counter!(name).increment(value);
    }

    fn observe(&self, name: &'static str, value: f64) {
        metrics::histogram!(name).record(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        metrics::gauge!(name).set(value);
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricSink for NoopMetrics {
    fn increment(&self, _name: &'static str, _value: u64) {}

    fn observe(&self, _name: &'static str, _value: f64) {}

    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}
