//! Metrics collection and export module

use crate::types::{OperationKind, OperationState};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub submissions_total: IntCounterVec,
    pub submission_errors: IntCounterVec,
    pub simulation_rejections: IntCounter,
    pub operations_confirmed: IntCounter,
    pub operations_failed: IntCounter,
    pub operations_timed_out: IntCounter,

    // Signal bookkeeping
    pub duplicate_signals_ignored: IntCounter,
    pub stale_generation_signals: IntCounter,
    pub invalidations_published: IntCounter,

    // Gauges
    pub operations_in_flight: IntGauge,
    pub context_generation: IntGauge,

    // Histograms
    pub confirmation_latency: Histogram,
    pub simulation_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let submissions_total = IntCounterVec::new(
            Opts::new("submissions_total", "Write operations accepted by the ledger"),
            &["kind"],
        )?;

        let submission_errors = IntCounterVec::new(
            Opts::new(
                "submission_errors_total",
                "Submissions that returned a synchronous error",
            ),
            &["category"],
        )?;

        let simulation_rejections = IntCounter::with_opts(Opts::new(
            "simulation_rejections_total",
            "Submissions refused by the pre-flight dry-run",
        ))?;

        let operations_confirmed = IntCounter::with_opts(Opts::new(
            "operations_confirmed_total",
            "Operations that reached Confirmed",
        ))?;

        let operations_failed = IntCounter::with_opts(Opts::new(
            "operations_failed_total",
            "Operations that reverted on the ledger",
        ))?;

        let operations_timed_out = IntCounter::with_opts(Opts::new(
            "operations_timed_out_total",
            "Operations with no confirmation inside the window",
        ))?;

        let duplicate_signals_ignored = IntCounter::with_opts(Opts::new(
            "duplicate_signals_ignored_total",
            "Confirmation signals for handles that were already terminal",
        ))?;

        let stale_generation_signals = IntCounter::with_opts(Opts::new(
            "stale_generation_signals_total",
            "Signals discarded because the account context changed",
        ))?;

        let invalidations_published = IntCounter::with_opts(Opts::new(
            "invalidations_published_total",
            "Read keys published to the invalidator",
        ))?;

        let operations_in_flight = IntGauge::with_opts(Opts::new(
            "operations_in_flight",
            "Operations submitted and not yet terminal",
        ))?;

        let context_generation = IntGauge::with_opts(Opts::new(
            "context_generation",
            "Current account context generation",
        ))?;

        let confirmation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "confirmation_latency_seconds",
                "Time from handle to terminal state",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 30.0, 60.0]),
        )?;

        let simulation_latency = Histogram::with_opts(
            HistogramOpts::new("simulation_latency_seconds", "Dry-run round-trip latency")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(submissions_total.clone()))?;
        registry.register(Box::new(submission_errors.clone()))?;
        registry.register(Box::new(simulation_rejections.clone()))?;
        registry.register(Box::new(operations_confirmed.clone()))?;
        registry.register(Box::new(operations_failed.clone()))?;
        registry.register(Box::new(operations_timed_out.clone()))?;
        registry.register(Box::new(duplicate_signals_ignored.clone()))?;
        registry.register(Box::new(stale_generation_signals.clone()))?;
        registry.register(Box::new(invalidations_published.clone()))?;
        registry.register(Box::new(operations_in_flight.clone()))?;
        registry.register(Box::new(context_generation.clone()))?;
        registry.register(Box::new(confirmation_latency.clone()))?;
        registry.register(Box::new(simulation_latency.clone()))?;

        Ok(Self {
            registry,
            submissions_total,
            submission_errors,
            simulation_rejections,
            operations_confirmed,
            operations_failed,
            operations_timed_out,
            duplicate_signals_ignored,
            stale_generation_signals,
            invalidations_published,
            operations_in_flight,
            context_generation,
            confirmation_latency,
            simulation_latency,
        })
    }

    pub fn record_submission(&self, kind: OperationKind) {
        self.submissions_total.with_label_values(&[kind.label()]).inc();
        self.operations_in_flight.inc();
    }

    pub fn record_submission_error(&self, category: &str) {
        self.submission_errors.with_label_values(&[category]).inc();
    }

    /// Count a terminal outcome and release its in-flight slot
    pub fn record_terminal(&self, state: OperationState) {
        match state {
            OperationState::Confirmed => self.operations_confirmed.inc(),
            OperationState::Failed => self.operations_failed.inc(),
            OperationState::TimedOut => self.operations_timed_out.inc(),
            other => {
                tracing::debug!("Not a terminal state: {}", other);
                return;
            }
        }
        self.operations_in_flight.dec();
    }

    /// Render the registry in the Prometheus text format
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Start timing from an earlier instant, e.g. when a handle was obtained
    pub fn since(start: Instant) -> Self {
        Self { start }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
