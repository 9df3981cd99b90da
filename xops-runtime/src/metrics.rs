//! Prometheus metrics shared by the controllers.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::watch::breaker::{Outcome, Transition};

/// Counters and histograms the controllers drive.
///
/// The label maps inside each vec provide the lazy per-label-set
/// registration; callers just call `with_label_values`.
#[derive(Clone)]
pub struct ControllerMetrics {
    reconciles: IntCounterVec,
    reconcile_duration: HistogramVec,
    operations_created: IntCounterVec,
    breaker_outcomes: IntCounterVec,
    breaker_transitions: IntCounterVec,
}

impl ControllerMetrics {
    /// Create the metrics and register them with a registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.reconciles.clone()))?;
        registry.register(Box::new(metrics.reconcile_duration.clone()))?;
        registry.register(Box::new(metrics.operations_created.clone()))?;
        registry.register(Box::new(metrics.breaker_outcomes.clone()))?;
        registry.register(Box::new(metrics.breaker_transitions.clone()))?;
        Ok(metrics)
    }

    /// Create the metrics without registering them anywhere.
    pub fn unregistered() -> Self {
        Self {
            reconciles: IntCounterVec::new(
                Opts::new("operation_reconciles_total", "Reconciles per controller."),
                &["controller", "result"],
            )
            .unwrap_or_else(|e| panic!("failed to create operation_reconciles_total: {e}")),
            reconcile_duration: HistogramVec::new(
                HistogramOpts::new(
                    "operation_reconcile_seconds",
                    "Time spent reconciling, per controller.",
                ),
                &["controller"],
            )
            .unwrap_or_else(|e| panic!("failed to create operation_reconcile_seconds: {e}")),
            operations_created: IntCounterVec::new(
                Opts::new(
                    "operations_created_total",
                    "Operations created, per creating controller.",
                ),
                &["controller"],
            )
            .unwrap_or_else(|e| panic!("failed to create operations_created_total: {e}")),
            breaker_outcomes: IntCounterVec::new(
                Opts::new(
                    "watch_circuit_breaker_events_total",
                    "Watch events per circuit breaker outcome.",
                ),
                &["watch_operation", "outcome"],
            )
            .unwrap_or_else(|e| panic!("failed to create watch_circuit_breaker_events_total: {e}")),
            breaker_transitions: IntCounterVec::new(
                Opts::new(
                    "watch_circuit_breaker_transitions_total",
                    "Circuit breaker state transitions.",
                ),
                &["watch_operation", "from", "to"],
            )
            .unwrap_or_else(|e| {
                panic!("failed to create watch_circuit_breaker_transitions_total: {e}")
            }),
        }
    }

    pub(crate) fn reconciled(&self, controller: &str, result: &str) {
        self.reconciles
            .with_label_values(&[controller, result])
            .inc();
    }

    pub(crate) fn time_reconcile(&self, controller: &str) -> prometheus::HistogramTimer {
        self.reconcile_duration
            .with_label_values(&[controller])
            .start_timer()
    }

    pub(crate) fn operation_created(&self, controller: &str) {
        self.operations_created
            .with_label_values(&[controller])
            .inc();
    }

    pub(crate) fn breaker_outcome(&self, watch_operation: &str, outcome: Outcome) {
        self.breaker_outcomes
            .with_label_values(&[watch_operation, outcome.as_str()])
            .inc();
    }

    pub(crate) fn breaker_transition(&self, watch_operation: &str, transition: Transition) {
        self.breaker_transitions
            .with_label_values(&[watch_operation, transition.from, transition.to])
            .inc();
    }
}
