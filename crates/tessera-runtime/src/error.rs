//! Errors surfaced by the orchestrator facade.

use tessera_core::{PlanError, RegistryError};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Plan rejected: {0}")]
    Plan(#[from] PlanError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plan task ended abnormally: {0}")]
    Join(String),

    #[error("No tokio runtime is available to execute the plan")]
    NoRuntime,

    #[cfg(feature = "metrics")]
    #[error("Metrics error: {0}")]
    Metrics(#[from] tessera_observability::MetricsError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
