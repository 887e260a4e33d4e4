//! Capability registry errors.

use crate::identifiers::{CapabilityName, HandlerId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("capability '{capability}' already has a handler named '{handler}'")]
    DuplicateCapability {
        capability: CapabilityName,
        handler: HandlerId,
    },

    #[error("capability '{capability}' not found")]
    CapabilityNotFound { capability: CapabilityName },
}

pub type RegistryResult<T> = Result<T, RegistryError>;
