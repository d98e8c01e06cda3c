//! Prometheus metrics for one controller.
//!
//! Metrics are registered in a caller-owned [`Registry`] rather than the
//! process-global default one, so several controllers (and tests) can coexist.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;

/// Metrics shared by event sources and workers of one controller.
#[derive(Clone)]
pub struct ControllerMetrics {
    reconciliations: IntCounterVec,
    reconcile_duration: Histogram,
    queue_depth: IntGauge,
    events: IntCounterVec,
    fan_out_requests: IntCounter,
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

impl ControllerMetrics {
    /// Create the metrics of `controller` and register them with `registry`.
    pub fn new(registry: &Registry, controller: &str) -> Result<Self, prometheus::Error> {
        let reconciliations = IntCounterVec::new(
            Opts::new(
                "controller_reconciliations_total",
                "Number of reconciliations by result",
            )
            .const_label("controller", controller),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "controller_reconcile_duration_seconds",
                "Duration (in seconds) of reconciliations",
            )
            .const_label("controller", controller)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let queue_depth = IntGauge::with_opts(
            Opts::new(
                "controller_workqueue_depth",
                "Number of requests waiting for a worker",
            )
            .const_label("controller", controller),
        )?;
        let events = IntCounterVec::new(
            Opts::new(
                "controller_watch_events_total",
                "Number of watch events by kind, type and filter decision",
            )
            .const_label("controller", controller),
            &["kind", "event", "decision"],
        )?;
        let fan_out_requests = IntCounter::with_opts(
            Opts::new(
                "controller_fanout_requests_total",
                "Number of reconcile requests produced by routing admitted events",
            )
            .const_label("controller", controller),
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(fan_out_requests.clone()))?;

        Ok(Self {
            reconciliations,
            reconcile_duration,
            queue_depth,
            events,
            fan_out_requests,
        })
    }

    /// Record one finished reconciliation.
    pub fn observe_reconcile(&self, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconciliations.with_label_values(&[result]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    /// Record a watch event and whether the filter admitted it.
    pub fn observe_event(&self, kind: &str, event: &str, admitted: bool) {
        let decision = if admitted { "admitted" } else { "rejected" };
        self.events.with_label_values(&[kind, event, decision]).inc();
    }

    /// Record the requests produced for one admitted event.
    pub fn observe_fan_out(&self, requests: usize) {
        self.fan_out_requests
            .inc_by(u64::try_from(requests).unwrap_or(u64::MAX));
    }

    /// Update the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Number of reconciliations recorded with the given result.
    pub fn reconciliations(&self, success: bool) -> u64 {
        let result = if success { "success" } else { "error" };
        self.reconciliations.with_label_values(&[result]).get()
    }

    /// Number of events of `kind` recorded with the given decision.
    pub fn events(&self, kind: &str, event: &str, admitted: bool) -> u64 {
        let decision = if admitted { "admitted" } else { "rejected" };
        self.events.with_label_values(&[kind, event, decision]).get()
    }

    /// Total requests produced by fan-out.
    pub fn fan_out_requests(&self) -> u64 {
        self.fan_out_requests.get()
    }
}
