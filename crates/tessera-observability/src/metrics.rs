//! Orchestrator Metrics
//!
//! Prometheus collectors for plan and step execution. Label cardinality is
//! bounded by the number of registered capabilities plus a fixed outcome set.

use crate::LATENCY_BUCKETS;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use thiserror::Error;

/// Collectors recorded by the runtime.
#[derive(Debug, Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,
    pub plans_total: IntCounterVec,           // outcome
    pub step_attempts_total: IntCounterVec,   // capability, outcome
    pub step_duration_seconds: HistogramVec,  // capability
    pub admission_wait_seconds: HistogramVec, // capability
    pub step_retries_total: IntCounterVec,    // capability
    pub steps_running: IntGaugeVec,           // capability
}

impl OrchestratorMetrics {
    /// Create collectors under `namespace` in a fresh registry.
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        Self::with_registry(namespace, Registry::new())
    }

    /// Create collectors and register them into an existing registry.
    pub fn with_registry(namespace: &str, registry: Registry) -> Result<Self, MetricsError> {
        let plans_total = IntCounterVec::new(
            Opts::new(
                format!("{}_plans_total", namespace),
                "Plans finished by outcome",
            ),
            &["outcome"],
        )?;

        let step_attempts_total = IntCounterVec::new(
            Opts::new(
                format!("{}_step_attempts_total", namespace),
                "Step attempts finished by capability and outcome",
            ),
            &["capability", "outcome"],
        )?;

        let step_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_step_duration_seconds", namespace),
                "Handler execution time in seconds by capability",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["capability"],
        )?;

        let admission_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_admission_wait_seconds", namespace),
                "Time spent waiting for a capability slot in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["capability"],
        )?;

        let step_retries_total = IntCounterVec::new(
            Opts::new(
                format!("{}_step_retries_total", namespace),
                "Retries and fallback attempts scheduled by capability",
            ),
            &["capability"],
        )?;

        let steps_running = IntGaugeVec::new(
            Opts::new(
                format!("{}_steps_running", namespace),
                "Step instances currently executing by capability",
            ),
            &["capability"],
        )?;

        registry.register(Box::new(plans_total.clone()))?;
        registry.register(Box::new(step_attempts_total.clone()))?;
        registry.register(Box::new(step_duration_seconds.clone()))?;
        registry.register(Box::new(admission_wait_seconds.clone()))?;
        registry.register(Box::new(step_retries_total.clone()))?;
        registry.register(Box::new(steps_running.clone()))?;

        Ok(Self {
            registry,
            plans_total,
            step_attempts_total,
            step_duration_seconds,
            admission_wait_seconds,
            step_retries_total,
            steps_running,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_plan(&self, outcome: &str) {
        self.plans_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_attempt(&self, capability: &str, outcome: &str, duration: Duration) {
        self.step_attempts_total
            .with_label_values(&[capability, outcome])
            .inc();
        self.step_duration_seconds
            .with_label_values(&[capability])
            .observe(duration.as_secs_f64());
    }

    pub fn record_admission_wait(&self, capability: &str, wait: Duration) {
        self.admission_wait_seconds
            .with_label_values(&[capability])
            .observe(wait.as_secs_f64());
    }

    pub fn record_retry(&self, capability: &str) {
        self.step_retries_total
            .with_label_values(&[capability])
            .inc();
    }

    pub fn step_started(&self, capability: &str) {
        self.steps_running.with_label_values(&[capability]).inc();
    }

    pub fn step_finished(&self, capability: &str) {
        self.steps_running.with_label_values(&[capability]).dec();
    }

    /// Text exposition of every collector in the registry.
    pub fn render(&self) -> Result<String, MetricsError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Metrics system errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics encoding failed: {0}")]
    Encoding(String),
}
