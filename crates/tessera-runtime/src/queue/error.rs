//! Error types for admission control.

use tessera_core::{CapabilityName, HandlerId};

/// Task queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Waited {waited_ms}ms for a '{capability}/{handler}' slot")]
    AdmissionTimeout {
        capability: CapabilityName,
        handler: HandlerId,
        waited_ms: u64,
    },

    #[error("Task queue closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;
