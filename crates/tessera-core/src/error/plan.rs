//! Pre-execution validation errors.
//!
//! These surface synchronously from plan submission; when one is returned
//! no step of the plan has been admitted.

use crate::identifiers::{CapabilityName, IdValidationError, StepId};

/// Reasons a plan is rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle. `steps` lists every step whose
    /// level could not be resolved, in declaration order.
    #[error("dependency cycle among steps [{}]", join_ids(.steps))]
    DependencyCycle { steps: Vec<StepId> },

    /// A step names a capability with no registered handler.
    #[error("step '{step}' requires unknown capability '{capability}'")]
    CapabilityNotFound {
        step: StepId,
        capability: CapabilityName,
    },

    /// A step depends on a step id that is not part of the plan.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    /// Two steps share one id.
    #[error("step id '{step}' is declared more than once")]
    DuplicateStep { step: StepId },

    /// A builder was handed a string that is not a valid identifier.
    #[error("invalid identifier '{value}': {reason}")]
    InvalidIdentifier {
        value: String,
        reason: IdValidationError,
    },

    /// A retry policy or timeout is out of range.
    #[error("step '{step}' has an invalid policy: {reason}")]
    InvalidPolicy { step: StepId, reason: String },
}

impl PlanError {
    pub fn invalid_identifier(value: impl Into<String>, reason: IdValidationError) -> Self {
        Self::InvalidIdentifier {
            value: value.into(),
            reason,
        }
    }
}

fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for plan validation.
pub type PlanResult<T> = Result<T, PlanError>;
