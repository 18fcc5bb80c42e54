//! Prometheus metrics for the alert path
//!
//! Each alert sink owns its own registry, so independent loggers (and tests)
//! never share counters.

use logrelay_core::OutputError;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Metrics collector for one alert sink
pub struct AlertMetrics {
    registry: Registry,

    alerts_enqueued_total: CounterVec,
    alerts_delivered_total: Counter,
    alert_delivery_failures_total: Counter,
    alerts_rejected_total: Counter,

    context_buckets: Gauge,
    context_buckets_evicted_total: Counter,
}

fn metric_err(e: prometheus::Error) -> OutputError {
    OutputError::Metrics(format!("Failed to create metric: {}", e))
}

impl AlertMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, OutputError> {
        let registry = Registry::new();

        let alerts_enqueued_total = CounterVec::new(
            Opts::new(
                "logrelay_alerts_enqueued_total",
                "Alert messages admitted to the dispatch queue",
            ),
            &["header"],
        )
        .map_err(metric_err)?;

        let alerts_delivered_total = Counter::new(
            "logrelay_alerts_delivered_total",
            "Alert messages accepted by the transport",
        )
        .map_err(metric_err)?;

        let alert_delivery_failures_total = Counter::new(
            "logrelay_alert_delivery_failures_total",
            "Alert messages the transport failed to deliver",
        )
        .map_err(metric_err)?;

        let alerts_rejected_total = Counter::new(
            "logrelay_alerts_rejected_total",
            "Alert messages offered after the dispatch queue closed",
        )
        .map_err(metric_err)?;

        let context_buckets = Gauge::new(
            "logrelay_context_buckets",
            "Correlation keys currently holding context lines",
        )
        .map_err(metric_err)?;

        let context_buckets_evicted_total = Counter::new(
            "logrelay_context_buckets_evicted_total",
            "Context buckets dropped by TTL expiry",
        )
        .map_err(metric_err)?;

        for collector in [
            Box::new(alerts_enqueued_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(alerts_delivered_total.clone()),
            Box::new(alert_delivery_failures_total.clone()),
            Box::new(alerts_rejected_total.clone()),
            Box::new(context_buckets.clone()),
            Box::new(context_buckets_evicted_total.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| OutputError::Metrics(format!("Failed to register metric: {}", e)))?;
        }

        Ok(Self {
            registry,
            alerts_enqueued_total,
            alerts_delivered_total,
            alert_delivery_failures_total,
            alerts_rejected_total,
            context_buckets,
            context_buckets_evicted_total,
        })
    }

    pub fn record_enqueued(&self, header: &str) {
        self.alerts_enqueued_total.with_label_values(&[header]).inc();
    }

    pub fn record_delivered(&self) {
        self.alerts_delivered_total.inc();
    }

    pub fn record_delivery_failure(&self) {
        self.alert_delivery_failures_total.inc();
    }

    pub fn record_rejected(&self) {
        self.alerts_rejected_total.inc();
    }

    pub fn record_evicted(&self) {
        self.context_buckets_evicted_total.inc();
    }

    pub fn set_context_buckets(&self, count: usize) {
        self.context_buckets.set(count as f64);
    }

    pub fn delivered(&self) -> u64 {
        self.alerts_delivered_total.get() as u64
    }

    pub fn delivery_failures(&self) -> u64 {
        self.alert_delivery_failures_total.get() as u64
    }

    pub fn evicted(&self) -> u64 {
        self.context_buckets_evicted_total.get() as u64
    }

    /// Get metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, OutputError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| OutputError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| OutputError::Metrics(e.to_string()))
    }
}
