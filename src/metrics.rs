//! Prometheus metrics
//!
//! Each orchestrator owns its own registry so several can coexist in one
//! process (tests do this).

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

pub struct MigrationMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
    in_flight: IntGauge,
}

impl MigrationMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "volume_migrator_operations_total",
                "Resize and delete operations by result",
            ),
            &["operation", "result"],
        )
        .map_err(metrics_error)?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "volume_migrator_operation_duration_seconds",
                "Duration of resize and delete operations",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let in_flight = IntGauge::new(
            "volume_migrator_operations_in_flight",
            "Operations currently running",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(in_flight.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            duration,
            in_flight,
        })
    }

    pub fn started(&self) {
        self.in_flight.inc();
    }

    /// Record a finished operation; `result` is "success" or an error class
    pub fn finished(&self, operation: &str, result: &str, elapsed: Duration) {
        self.in_flight.dec();
        self.operations
            .with_label_values(&[operation, result])
            .inc();
        self.duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn operation_count(&self, operation: &str, result: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, result])
            .get()
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
