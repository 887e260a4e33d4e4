//! Orchestrator settings.
//!
//! [`OrchestratorConfig::builder`] validates programmatic settings and
//! [`OrchestratorConfig::from_env`] overlays these variables on the defaults:
//!
//! - `TESSERA_ADMISSION_TIMEOUT` - Max wait for a capability slot (default: 30s)
//! - `TESSERA_DEFAULT_STEP_TIMEOUT` - Step timeout when a step declares none (default: 30s)
//! - `TESSERA_DEFAULT_PLAN_TIMEOUT` - Plan timeout when a plan declares none (default: 5m)
//! - `TESSERA_HEALTH_PROBE_INTERVAL` - Health probe period (default: 15s)
//! - `TESSERA_HEALTH_PROBE_TIMEOUT` - Deadline for one probe (default: 2s)
//! - `TESSERA_EVENT_CHANNEL_CAPACITY` - Stream channel bound (default: 256)
//! - `TESSERA_MAX_BACKOFF` - Upper bound on any retry delay (default: 30s)
//! - `TESSERA_DEFAULT_MERGE_WEIGHT` - Weight for sources without an entry (default: 1.0)
//! - `TESSERA_MERGE_WEIGHTS` - Per-source weights, `search=2.0,recommend=0.5`
//! - `TESSERA_LOG_FORMAT` - `compact` or `json` (default: compact)
//! - `TESSERA_METRICS_NAMESPACE` - Metrics name prefix (default: tessera)
//!
//! Durations use humantime syntax: `250ms`, `2s`, `5m`.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::{env, fmt, time::Duration};

use tessera_core::CapabilityName;
use tessera_observability::{LogFormat, ObservabilityConfig};

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: {message}")]
    Env { key: String, message: String },

    #[error("invalid orchestrator config: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn env(key: &str, message: impl fmt::Display) -> Self {
        Self::Env {
            key: key.to_owned(),
            message: message.to_string(),
        }
    }
}

const fn non_zero(value: usize) -> NonZeroUsize {
    match NonZeroUsize::new(value) {
        Some(value) => value,
        None => panic!("constant must be non-zero"),
    }
}

/// `value` as a `NonZeroUsize` no greater than `max`.
fn bounded_count(what: &str, value: usize, max: usize) -> Result<NonZeroUsize, ConfigError> {
    match NonZeroUsize::new(value) {
        Some(count) if value <= max => Ok(count),
        _ => Err(ConfigError::Invalid(format!(
            "{what} must be between 1 and {max}, got {value}"
        ))),
    }
}

/// In-flight ceiling for one handler (1 to 10,000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConcurrencyLimit(NonZeroUsize);

impl ConcurrencyLimit {
    pub const MAX: usize = 10_000;
    pub const DEFAULT: ConcurrencyLimit = ConcurrencyLimit(non_zero(10));

    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        bounded_count("concurrency limit", limit, Self::MAX).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bound of each plan's event channel (1 to 65,536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelCapacity(NonZeroUsize);

impl ChannelCapacity {
    pub const MAX: usize = 65_536;
    pub const DEFAULT: ChannelCapacity = ChannelCapacity(non_zero(256));

    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        bounded_count("event channel capacity", capacity, Self::MAX).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl Default for ChannelCapacity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Validated merge weight: finite and in `(0.0, 1000.0]`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct MergeWeight(f64);

impl MergeWeight {
    pub const MAX: f64 = 1000.0;
    pub const ONE: MergeWeight = MergeWeight(1.0);

    pub fn new(weight: f64) -> Result<Self, ConfigError> {
        if !weight.is_finite() || weight <= 0.0 || weight > Self::MAX {
            return Err(ConfigError::Invalid(format!(
                "merge weight must be in (0.0, {}], got {weight}",
                Self::MAX
            )));
        }
        Ok(Self(weight))
    }

    pub fn get(&self) -> f64 {
        self.0
    }
}

impl Default for MergeWeight {
    fn default() -> Self {
        Self::ONE
    }
}

/// Per-source weights used when several capabilities contribute to one key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeWeights {
    weights: HashMap<CapabilityName, MergeWeight>,
    default_weight: MergeWeight,
}

impl MergeWeights {
    pub fn new(default_weight: MergeWeight) -> Self {
        Self {
            weights: HashMap::new(),
            default_weight,
        }
    }

    pub fn with(mut self, source: CapabilityName, weight: MergeWeight) -> Self {
        self.weights.insert(source, weight);
        self
    }

    pub fn weight_for(&self, source: &CapabilityName) -> f64 {
        self.weights
            .get(source)
            .copied()
            .unwrap_or(self.default_weight)
            .get()
    }

    pub fn default_weight(&self) -> MergeWeight {
        self.default_weight
    }

    /// Parse `name=weight` pairs separated by commas.
    pub fn parse_pairs(pairs: &str, default_weight: MergeWeight) -> Result<Self, ConfigError> {
        let mut weights = Self::new(default_weight);
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, weight) = pair.split_once('=').ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "merge weight entry '{pair}' must look like name=weight"
                ))
            })?;
            let name = CapabilityName::parse(name.trim()).map_err(|e| {
                ConfigError::Invalid(format!("invalid merge source '{name}': {e}"))
            })?;
            let weight = weight.trim().parse::<f64>().map_err(|e| {
                ConfigError::Invalid(format!("invalid weight for '{name}': {e}"))
            })?;
            weights = weights.with(name, MergeWeight::new(weight)?);
        }
        Ok(weights)
    }
}

/// Orchestrator runtime settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub admission_timeout: Duration,
    pub default_step_timeout: Duration,
    pub default_plan_timeout: Duration,
    pub health_probe_interval: Duration,
    pub health_probe_timeout: Duration,
    pub event_channel_capacity: ChannelCapacity,
    pub max_backoff: Duration,
    pub merge_weights: MergeWeights,
    pub observability: ObservabilityConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            admission_timeout: Duration::from_secs(30),
            default_step_timeout: Duration::from_secs(30),
            default_plan_timeout: Duration::from_secs(300),
            health_probe_interval: Duration::from_secs(15),
            health_probe_timeout: Duration::from_secs(2),
            event_channel_capacity: ChannelCapacity::default(),
            max_backoff: Duration::from_secs(30),
            merge_weights: MergeWeights::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Load from `TESSERA_*` variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        OrchestratorConfigBuilder::from_env()?.build()
    }
}

/// Validating builder for [`OrchestratorConfig`].
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the defaults overlaid with any `TESSERA_*` variables that
    /// are set. Blank variables count as unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = OrchestratorConfig::default();

        let durations = [
            ("TESSERA_ADMISSION_TIMEOUT", &mut config.admission_timeout),
            ("TESSERA_DEFAULT_STEP_TIMEOUT", &mut config.default_step_timeout),
            ("TESSERA_DEFAULT_PLAN_TIMEOUT", &mut config.default_plan_timeout),
            ("TESSERA_HEALTH_PROBE_INTERVAL", &mut config.health_probe_interval),
            ("TESSERA_HEALTH_PROBE_TIMEOUT", &mut config.health_probe_timeout),
            ("TESSERA_MAX_BACKOFF", &mut config.max_backoff),
        ];
        for (key, slot) in durations {
            if let Some(value) = env_duration(key)? {
                *slot = value;
            }
        }

        if let Some(capacity) = env_parsed::<usize>("TESSERA_EVENT_CHANNEL_CAPACITY")? {
            config.event_channel_capacity = ChannelCapacity::new(capacity)
                .map_err(|e| ConfigError::env("TESSERA_EVENT_CHANNEL_CAPACITY", e))?;
        }

        let default_weight = env_parsed::<f64>("TESSERA_DEFAULT_MERGE_WEIGHT")?
            .map(MergeWeight::new)
            .transpose()
            .map_err(|e| ConfigError::env("TESSERA_DEFAULT_MERGE_WEIGHT", e))?
            .unwrap_or_default();
        config.merge_weights = match env_raw("TESSERA_MERGE_WEIGHTS") {
            Some(pairs) => MergeWeights::parse_pairs(&pairs, default_weight)
                .map_err(|e| ConfigError::env("TESSERA_MERGE_WEIGHTS", e))?,
            None => MergeWeights::new(default_weight),
        };

        if let Some(format) = env_parsed::<LogFormat>("TESSERA_LOG_FORMAT")? {
            config.observability.log_format = format;
        }
        if let Some(namespace) = env_raw("TESSERA_METRICS_NAMESPACE") {
            config.observability.namespace = namespace;
        }

        Ok(Self { config })
    }

    #[must_use]
    pub fn admission_timeout(mut self, timeout: Duration) -> Self {
        self.config.admission_timeout = timeout;
        self
    }

    #[must_use]
    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_step_timeout = timeout;
        self
    }

    #[must_use]
    pub fn default_plan_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_plan_timeout = timeout;
        self
    }

    #[must_use]
    pub fn health_probe_interval(mut self, interval: Duration) -> Self {
        self.config.health_probe_interval = interval;
        self
    }

    #[must_use]
    pub fn health_probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_probe_timeout = timeout;
        self
    }

    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: ChannelCapacity) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.config.max_backoff = max_backoff;
        self
    }

    #[must_use]
    pub fn merge_weights(mut self, weights: MergeWeights) -> Self {
        self.config.merge_weights = weights;
        self
    }

    #[must_use]
    pub fn observability(mut self, observability: ObservabilityConfig) -> Self {
        self.config.observability = observability;
        self
    }

    /// Check cross-field constraints and return the config.
    pub fn build(self) -> Result<OrchestratorConfig, ConfigError> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let config = &self.config;
        let non_zero = [
            ("admission_timeout", config.admission_timeout),
            ("default_step_timeout", config.default_step_timeout),
            ("default_plan_timeout", config.default_plan_timeout),
            ("health_probe_interval", config.health_probe_interval),
            ("health_probe_timeout", config.health_probe_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if config.health_probe_timeout > config.health_probe_interval {
            return Err(ConfigError::Invalid(
                "health_probe_timeout must not exceed health_probe_interval".to_owned(),
            ));
        }
        config
            .observability
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Non-blank value of `key`.
fn env_raw(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_raw(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| ConfigError::env(key, format!("cannot parse '{raw}': {e}")))
        })
        .transpose()
}

fn env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    env_raw(key)
        .map(|raw| {
            humantime::parse_duration(&raw)
                .map_err(|e| ConfigError::env(key, format!("bad duration '{raw}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass_validation() {
        let config = OrchestratorConfigBuilder::new().build().unwrap();
        assert_eq!(config.admission_timeout, Duration::from_secs(30));
        assert_eq!(config.default_plan_timeout, Duration::from_secs(300));
        assert_eq!(config.event_channel_capacity.get(), 256);
        assert_eq!(config.merge_weights.default_weight().get(), 1.0);
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = OrchestratorConfig::builder()
            .default_step_timeout(Duration::ZERO)
            .build();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("default_step_timeout must be greater than 0")
        );
    }

    #[test]
    fn test_builder_rejects_probe_timeout_over_interval() {
        let result = OrchestratorConfig::builder()
            .health_probe_interval(Duration::from_secs(1))
            .health_probe_timeout(Duration::from_secs(2))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_limits_accept_their_bounds() {
        for limit in [1, 64, ConcurrencyLimit::MAX] {
            assert_eq!(ConcurrencyLimit::new(limit).unwrap().get(), limit);
        }
        assert!(ConcurrencyLimit::new(ConcurrencyLimit::MAX + 1).is_err());
    }

    #[test]
    fn test_channel_capacity_validation() {
        assert_eq!(ChannelCapacity::default().get(), 256);
        assert_eq!(ConcurrencyLimit::default().get(), 10);
        assert!(ChannelCapacity::new(0).is_err());
        assert!(ChannelCapacity::new(ChannelCapacity::MAX + 1).is_err());
    }

    #[test]
    fn test_merge_weight_validation() {
        assert!(MergeWeight::new(0.5).is_ok());
        assert!(MergeWeight::new(0.0).is_err());
        assert!(MergeWeight::new(-1.0).is_err());
        assert!(MergeWeight::new(f64::NAN).is_err());
        assert!(MergeWeight::new(MergeWeight::MAX + 1.0).is_err());
    }

    #[test]
    fn test_merge_weights_parse_pairs() {
        let weights = MergeWeights::parse_pairs(" search=2.0, recommend=0.5 ,", MergeWeight::ONE)
            .unwrap();
        assert_eq!(weights.weight_for(&CapabilityName::new_unchecked("search")), 2.0);
        assert_eq!(
            weights.weight_for(&CapabilityName::new_unchecked("recommend")),
            0.5
        );
        assert_eq!(weights.weight_for(&CapabilityName::new_unchecked("other")), 1.0);

        assert!(MergeWeights::parse_pairs("search", MergeWeight::ONE).is_err());
        assert!(MergeWeights::parse_pairs("search=abc", MergeWeight::ONE).is_err());
        assert!(MergeWeights::parse_pairs("search=0", MergeWeight::ONE).is_err());
    }

    #[test]
    fn test_env_helpers_ignore_missing() {
        assert_eq!(env_duration("TESSERA_TEST_NONEXISTENT").unwrap(), None);
        assert_eq!(env_parsed::<usize>("TESSERA_TEST_NONEXISTENT").unwrap(), None);
        assert_eq!(env_parsed::<f64>("TESSERA_TEST_NONEXISTENT").unwrap(), None);
    }

    #[test]
    fn test_bounded_count_message() {
        let err = ConcurrencyLimit::new(0).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid("concurrency limit must be between 1 and 10000, got 0".into())
        );
    }
}
