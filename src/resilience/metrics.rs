//! Metrics sink contract for the resilience core.
//!
//! The core never talks to an exporter directly; the surrounding server
//! wires its own registry behind this trait. Each controller state
//! transition emits exactly one corresponding update. Implementations
//! must not panic and should not block.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Metric label pairs, e.g. `[("operation", "listRooms"), ("source", "cache")]`.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Counter/gauge/duration sink implemented by the host application.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: Labels<'_>);
    fn record_gauge(&self, name: &str, value: f64, labels: Labels<'_>);
    fn record_duration(&self, name: &str, duration: Duration, labels: Labels<'_>);
}

/// Sink that drops everything; the default when the host wires nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: Labels<'_>) {}
    fn record_gauge(&self, _name: &str, _value: f64, _labels: Labels<'_>) {}
    fn record_duration(&self, _name: &str, _duration: Duration, _labels: Labels<'_>) {}
}

fn flatten(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

/// In-memory sink for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    durations: Mutex<HashMap<String, Vec<Duration>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .get(&flatten(name, labels))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.lock().get(&flatten(name, labels)).copied()
    }

    pub fn durations(&self, name: &str, labels: Labels<'_>) -> Vec<Duration> {
        self.durations
            .lock()
            .get(&flatten(name, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        *self.counters.lock().entry(flatten(name, labels)).or_insert(0) += 1;
    }

    fn record_gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.gauges.lock().insert(flatten(name, labels), value);
    }

    fn record_duration(&self, name: &str, duration: Duration, labels: Labels<'_>) {
        self.durations
            .lock()
            .entry(flatten(name, labels))
            .or_default()
            .push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_counter_accumulates_per_label_set() {
        let metrics = InMemoryMetrics::new();
        metrics.increment_counter("fallback_activated", &[("operation", "listRooms")]);
        metrics.increment_counter("fallback_activated", &[("operation", "listRooms")]);
        metrics.increment_counter("fallback_activated", &[("operation", "getRecording")]);

        assert_eq!(
            metrics.counter("fallback_activated", &[("operation", "listRooms")]),
            2
        );
        assert_eq!(
            metrics.counter("fallback_activated", &[("operation", "getRecording")]),
            1
        );
    }

    #[test]
    fn gauge_overwrites_and_durations_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.record_gauge("component_status", 1.0, &[("component", "api")]);
        metrics.record_gauge("component_status", 3.0, &[("component", "api")]);
        assert_eq!(
            metrics.gauge("component_status", &[("component", "api")]),
            Some(3.0)
        );

        metrics.record_duration("op_duration", Duration::from_millis(5), &[]);
        metrics.record_duration("op_duration", Duration::from_millis(7), &[]);
        assert_eq!(metrics.durations("op_duration", &[]).len(), 2);
    }

    #[test]
    fn noop_accepts_everything() {
        let noop = NoopMetrics;
        noop.increment_counter("x", &[]);
        noop.record_gauge("y", 1.0, &[]);
        noop.record_duration("z", Duration::ZERO, &[]);
    }
}
