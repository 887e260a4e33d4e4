//! Structured tracing setup.
//!
//! The runtime opens a `plan` span per execution and a `step` span per
//! attempt; this module only installs the subscriber that records them.

use crate::{LogFormat, ObservabilityConfig, ObservabilityError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber filtered by `RUST_LOG`, falling back to
/// `config.default_filter`. Fails if a global subscriber already exists.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| ObservabilityError::Filter(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
    };
    result.map_err(|e| ObservabilityError::SubscriberInstalled(e.to_string()))?;

    tracing::info!(
        namespace = %config.namespace,
        format = %config.log_format,
        "Initialized structured tracing"
    );
    Ok(())
}
