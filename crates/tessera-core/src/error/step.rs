//! Step-level and plan-level execution errors.

use serde::{Deserialize, Serialize};

use super::handler::HandlerError;
use crate::identifiers::{CapabilityName, HandlerId, StepId};

/// Failure of a single step attempt. Every variant except `Terminated` is
/// eligible for retry and fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// The step waited too long in the task queue.
    #[error("step '{step}' waited {waited_ms}ms for a '{capability}' slot")]
    AdmissionTimeout {
        step: StepId,
        capability: CapabilityName,
        waited_ms: u64,
    },

    /// The handler exceeded the step's deadline.
    #[error("step '{step}' exceeded its {timeout_ms}ms deadline")]
    StepTimeout { step: StepId, timeout_ms: u64 },

    /// The handler returned an error or panicked.
    #[error("step '{step}' handler '{handler}' failed: {source}")]
    HandlerFailed {
        step: StepId,
        handler: HandlerId,
        #[source]
        source: HandlerError,
    },

    /// The instance was cancelled (plan timeout or explicit termination).
    #[error("step '{step}' terminated: {reason}")]
    Terminated { step: StepId, reason: String },
}

impl StepError {
    pub fn step(&self) -> &StepId {
        match self {
            Self::AdmissionTimeout { step, .. }
            | Self::StepTimeout { step, .. }
            | Self::HandlerFailed { step, .. }
            | Self::Terminated { step, .. } => step,
        }
    }

    /// Whether the failure policy may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminated { .. })
    }

    /// Short machine-readable kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionTimeout { .. } => "admission_timeout",
            Self::StepTimeout { .. } => "step_timeout",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::Terminated { .. } => "terminated",
        }
    }
}

/// Plan-level failure carried by the terminal `error` event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The global plan deadline expired.
    #[error("plan exceeded its {timeout_ms}ms deadline")]
    PlanTimeout { timeout_ms: u64 },

    /// The caller cancelled the plan.
    #[error("plan cancelled by caller")]
    PlanCancelled,

    /// A required step failed after retries and fallback were exhausted.
    #[error("required step '{step}' failed: {source}")]
    RequiredStepFailed {
        step: StepId,
        #[source]
        source: StepError,
    },
}

impl ExecutionError {
    /// Outcome label for metrics and summaries.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::PlanTimeout { .. } => "timeout",
            Self::PlanCancelled => "cancelled",
            Self::RequiredStepFailed { .. } => "failed",
        }
    }
}

/// Result type alias for step attempts.
pub type StepResult<T> = Result<T, StepError>;
