// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Prometheus metrics for the svcat operator.
//!
//! All metrics carry the `svcat` namespace prefix and live in the registry owned by
//! [`Metrics`]. The engine builds one [`Metrics`] at startup and hands it to every
//! component; tests build their own so counts never leak between tests.
//!
//! # Metrics Categories
//!
//! - **Reconciliation Metrics** - reconcile outcomes, durations and requeues per kind
//! - **Broker Metrics** - OSB requests by operation and status class
//! - **Async Metrics** - active `last_operation` pollers and orphan mitigations
//! - **Queue Metrics** - keys waiting per queue
//! - **Leader Election Metrics** - leadership state changes
//!
//! The [`router`] serves `GET /metrics` and `GET /healthz`.

use crate::constants::{HEALTHZ_PATH, METRICS_PATH};
use crate::osb::OsbError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Namespace prefix for all svcat metrics
const METRICS_NAMESPACE: &str = "svcat";

/// Metric handles and the registry they are registered in.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,

    /// Total number of reconciliations by kind and status (`success`, `error`, `timeout`)
    pub reconciliations_total: CounterVec,

    /// Duration of reconciliations in seconds by kind
    pub reconciliation_duration_seconds: HistogramVec,

    /// Total number of requeues by kind and reason (`error`, `scheduled`)
    pub requeues_total: CounterVec,

    /// Total number of errors by kind and category (see `ReconcileError::category`)
    pub errors_total: CounterVec,

    /// Total number of OSB requests by operation and status class (`2xx`, `4xx`, `5xx`, `transport`)
    pub osb_requests_total: CounterVec,

    /// Number of running `last_operation` poll tasks
    pub poller_active_tasks: IntGauge,

    /// Keys waiting in each work queue
    pub queue_depth: IntGaugeVec,

    /// Total number of orphan-mitigation deprovisions issued by kind
    pub orphan_mitigations_total: CounterVec,

    /// Total number of leader election events by status (`acquired`, `lost`)
    pub leader_elections_total: CounterVec,

    /// Current leader election status (1 = leader, 0 = follower)
    pub leader_status: GaugeVec,
}

impl Metrics {
    /// Create and register every metric in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric definition is invalid or registered twice.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_reconciliations_total"),
                "Total number of reconciliations by kind and status",
            ),
            &["kind", "status"],
        )?;
        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{METRICS_NAMESPACE}_reconciliation_duration_seconds"),
                "Duration of reconciliations in seconds by kind",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["kind"],
        )?;
        let requeues_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_requeues_total"),
                "Total number of requeue operations by kind and reason",
            ),
            &["kind", "reason"],
        )?;
        let errors_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_errors_total"),
                "Total number of reconcile errors by kind and category",
            ),
            &["kind", "category"],
        )?;
        let osb_requests_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_osb_requests_total"),
                "Total number of OSB requests by operation and status class",
            ),
            &["operation", "status_class"],
        )?;
        let poller_active_tasks = IntGauge::new(
            format!("{METRICS_NAMESPACE}_poller_active_tasks"),
            "Number of running last_operation poll tasks",
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_queue_depth"),
                "Keys waiting in each work queue",
            ),
            &["queue"],
        )?;
        let orphan_mitigations_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_orphan_mitigations_total"),
                "Total number of orphan-mitigation deprovisions issued by kind",
            ),
            &["kind"],
        )?;
        let leader_elections_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_leader_elections_total"),
                "Total number of leader election events by status",
            ),
            &["status"],
        )?;
        let leader_status = GaugeVec::new(
            Opts::new(
                format!("{METRICS_NAMESPACE}_leader_status"),
                "Current leader election status (1 = leader, 0 = follower)",
            ),
            &["pod_name"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;
        registry.register(Box::new(requeues_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(osb_requests_total.clone()))?;
        registry.register(Box::new(poller_active_tasks.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(orphan_mitigations_total.clone()))?;
        registry.register(Box::new(leader_elections_total.clone()))?;
        registry.register(Box::new(leader_status.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            requeues_total,
            errors_total,
            osb_requests_total,
            poller_active_tasks,
            queue_depth,
            orphan_mitigations_total,
            leader_elections_total,
            leader_status,
        })
    }

    // ========================================================================
    // Helper Functions
    // ========================================================================

    /// Record a successful reconciliation
    pub fn record_reconciliation_success(&self, kind: &str, duration: Duration) {
        self.record_reconciliation(kind, "success", duration);
    }

    /// Record a failed reconciliation and its error category
    pub fn record_reconciliation_error(&self, kind: &str, category: &str, duration: Duration) {
        self.record_reconciliation(kind, "error", duration);
        self.errors_total.with_label_values(&[kind, category]).inc();
    }

    /// Record a reconciliation that ran past its deadline
    pub fn record_reconciliation_timeout(&self, kind: &str, duration: Duration) {
        self.record_reconciliation(kind, "timeout", duration);
    }

    fn record_reconciliation(&self, kind: &str, status: &str, duration: Duration) {
        self.reconciliations_total.with_label_values(&[kind, status]).inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[kind])
            .observe(duration.as_secs_f64());
    }

    /// Record a requeue
    pub fn record_requeue(&self, kind: &str, reason: &str) {
        self.requeues_total.with_label_values(&[kind, reason]).inc();
    }

    /// Record the outcome of one OSB call
    pub fn record_osb_request<T>(&self, operation: &str, result: &Result<T, OsbError>) {
        let status_class = match result {
            Ok(_) => "2xx",
            Err(e) => match e.status() {
                Some(status) if status < 300 => "2xx",
                Some(status) if status < 500 => "4xx",
                Some(_) => "5xx",
                None => "transport",
            },
        };
        self.osb_requests_total
            .with_label_values(&[operation, status_class])
            .inc();
    }

    /// Record an orphan-mitigation deprovision
    pub fn record_orphan_mitigation(&self, kind: &str) {
        self.orphan_mitigations_total.with_label_values(&[kind]).inc();
    }

    /// Publish the depth of a queue
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[queue])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Record leader election acquired
    pub fn record_leader_elected(&self, pod_name: &str) {
        self.leader_elections_total.with_label_values(&["acquired"]).inc();
        self.leader_status.with_label_values(&[pod_name]).set(1.0);
    }

    /// Record leader election lost
    pub fn record_leader_lost(&self, pod_name: &str) {
        self.leader_elections_total.with_label_values(&["lost"]).inc();
        self.leader_status.with_label_values(&[pod_name]).set(0.0);
    }

    /// Gather and encode all metrics in Prometheus text format
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("UTF-8 error: {e}")))
    }
}

/// Router serving `/metrics` and `/healthz`.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .route(HEALTHZ_PATH, get(|| async { "ok" }))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.gather() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod metrics_tests;
