//! Tessera Observability
//!
//! Structured tracing setup and Prometheus metrics for plan execution.
//! Metrics live in an owned registry per orchestrator so several
//! orchestrators (and tests) can coexist in one process.

#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "metrics")]
pub use metrics::{MetricsError, OrchestratorMetrics};

#[cfg(feature = "tracing")]
pub mod trace;
#[cfg(feature = "tracing")]
pub use trace::init_tracing;

use std::fmt;
use std::str::FromStr;

/// Histogram bounds in seconds for step, attempt and plan durations.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        [Self::Compact, Self::Json]
            .into_iter()
            .find(|format| raw.eq_ignore_ascii_case(format.as_str()))
            .ok_or_else(|| format!("unknown log format '{raw}', expected compact or json"))
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging and metrics switches carried inside the orchestrator config.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Build an `OrchestratorMetrics` registry when none is supplied.
    pub metrics_enabled: bool,
    /// Let [`init_observability`] install the global subscriber.
    pub tracing_enabled: bool,
    /// Prefix of every metric name.
    pub namespace: String,
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: cfg!(feature = "metrics"),
            tracing_enabled: cfg!(feature = "tracing"),
            namespace: "tessera".to_owned(),
            log_format: LogFormat::Compact,
            default_filter: "info".to_owned(),
        }
    }
}

impl ObservabilityConfig {
    /// Metric names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
    pub fn validate(&self) -> Result<(), ObservabilityError> {
        let ns = self.namespace.as_bytes();
        let head_ok = ns
            .first()
            .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_');
        let tail_ok = ns
            .iter()
            .skip(1)
            .all(|b| b.is_ascii_alphanumeric() || *b == b'_');
        if head_ok && tail_ok {
            Ok(())
        } else {
            Err(ObservabilityError::Namespace(self.namespace.clone()))
        }
    }
}

/// Validate `config` and install the tracing subscriber it describes.
pub fn init_observability(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    config.validate()?;

    #[cfg(feature = "tracing")]
    if config.tracing_enabled {
        trace::init_tracing(config)?;
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("'{0}' is not a usable metric namespace")]
    Namespace(String),

    #[error("bad log filter: {0}")]
    Filter(String),

    #[error("a global tracing subscriber is already installed: {0}")]
    SubscriberInstalled(String),

    #[cfg(feature = "metrics")]
    #[error(transparent)]
    Metrics(#[from] metrics::MetricsError),
}
