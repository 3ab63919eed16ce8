//! Metrics recorder injected into every controller.
//!
//! Controllers only see the [`Metrics`] trait; the binary wires
//! [`OtelMetrics`] built from an OpenTelemetry meter, tests use a local
//! recorder.

use std::time::Duration;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Outcome label for counted operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

pub trait Metrics: Send + Sync {
    /// One persisted (or failed) status write, with its latency.
    fn status_update(&self, controller: &'static str, outcome: Outcome, elapsed: Duration);

    /// A reconcile pass that ended in an error of the given category.
    fn reconcile_error(&self, controller: &'static str, category: &'static str);

    /// A reconcile pass that deliberately wrote nothing.
    fn skipped_update(&self, controller: &'static str, reason: &'static str);

    /// An autonomously created database record (`vm` or `vapp`).
    fn record_created(&self, kind: &'static str, outcome: Outcome);

    fn controller_health(&self, controller: &'static str, healthy: bool);
}

/// OpenTelemetry-backed recorder.
pub struct OtelMetrics {
    status_updates: Counter<u64>,
    status_update_duration: Histogram<f64>,
    reconcile_errors: Counter<u64>,
    skipped_updates: Counter<u64>,
    records_created: Counter<u64>,
    controller_health: Gauge<i64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            status_updates: meter
                .u64_counter("ssvirt_status_updates_total")
                .with_description("Status writes by controller and outcome")
                .with_unit("{updates}")
                .build(),
            status_update_duration: meter
                .f64_histogram("ssvirt_status_update_duration_seconds")
                .with_description("Latency of status writes in seconds")
                .with_unit("s")
                .build(),
            reconcile_errors: meter
                .u64_counter("ssvirt_reconcile_errors_total")
                .with_description("Failed reconcile passes by controller and error category")
                .with_unit("{errors}")
                .build(),
            skipped_updates: meter
                .u64_counter("ssvirt_skipped_updates_total")
                .with_description("Reconcile passes that wrote nothing, by reason")
                .with_unit("{skips}")
                .build(),
            records_created: meter
                .u64_counter("ssvirt_records_created_total")
                .with_description("Database records created from cluster objects")
                .with_unit("{records}")
                .build(),
            controller_health: meter
                .i64_gauge("ssvirt_controller_healthy")
                .with_description("1 while the controller loop is running")
                .build(),
        }
    }
}

impl Metrics for OtelMetrics {
    fn status_update(&self, controller: &'static str, outcome: Outcome, elapsed: Duration) {
        let attrs = [
            KeyValue::new("controller", controller),
            KeyValue::new("outcome", outcome.as_str()),
        ];
        self.status_updates.add(1, &attrs);
        self.status_update_duration
            .record(elapsed.as_secs_f64(), &attrs);
    }

    fn reconcile_error(&self, controller: &'static str, category: &'static str) {
        self.reconcile_errors.add(
            1,
            &[
                KeyValue::new("controller", controller),
                KeyValue::new("category", category),
            ],
        );
    }

    fn skipped_update(&self, controller: &'static str, reason: &'static str) {
        self.skipped_updates.add(
            1,
            &[
                KeyValue::new("controller", controller),
                KeyValue::new("reason", reason),
            ],
        );
    }

    fn record_created(&self, kind: &'static str, outcome: Outcome) {
        self.records_created.add(
            1,
            &[
                KeyValue::new("kind", kind),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
    }

    fn controller_health(&self, controller: &'static str, healthy: bool) {
        self.controller_health.record(
            i64::from(healthy),
            &[KeyValue::new("controller", controller)],
        );
    }
}

/// Recorder that drops everything.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn status_update(&self, _: &'static str, _: Outcome, _: Duration) {}
    fn reconcile_error(&self, _: &'static str, _: &'static str) {}
    fn skipped_update(&self, _: &'static str, _: &'static str) {}
    fn record_created(&self, _: &'static str, _: Outcome) {}
    fn controller_health(&self, _: &'static str, _: bool) {}
}
