//! Error Types
//!
//! Errors are grouped by where they surface:
//! - `plan`: validation failures returned synchronously from submission
//! - `registry`: capability registration and lookup
//! - `handler`: the structured error a capability handler returns
//! - `step`: failures of one step attempt, and plan-level terminal errors

mod handler;
mod plan;
mod registry;
mod step;

pub use handler::HandlerError;
pub use plan::{PlanError, PlanResult};
pub use registry::{RegistryError, RegistryResult};
pub use step::{ExecutionError, StepError, StepResult};

/// Umbrella error for callers that do not care which layer failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TesseraError {
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

pub type TesseraResult<T> = Result<T, TesseraError>;
