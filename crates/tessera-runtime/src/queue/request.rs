//! Admission requests and the RAII permits that answer them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{StepId, StepPriority};

use super::QueueInner;
use crate::registry::{CapabilityDescriptor, DescriptorKey};

/// A step asking for a slot on one capability descriptor.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub step_id: StepId,
    pub descriptor: Arc<CapabilityDescriptor>,
    pub priority: StepPriority,
    /// Overrides the queue's admission timeout.
    pub timeout: Option<Duration>,
}

impl AdmissionRequest {
    pub fn new(
        step_id: StepId,
        descriptor: Arc<CapabilityDescriptor>,
        priority: StepPriority,
    ) -> Self {
        Self {
            step_id,
            descriptor,
            priority,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Proof of admission. Holding it occupies one slot on its descriptor;
/// dropping it frees the slot and lets the queue admit the next waiter.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit {
    pub(super) queue: Arc<QueueInner>,
    pub(super) key: DescriptorKey,
    pub(super) waited: Duration,
}

impl AdmissionPermit {
    pub fn key(&self) -> &DescriptorKey {
        &self.key
    }

    /// Time spent queued before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.queue.release(&self.key);
    }
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("key", &self.key)
            .field("waited", &self.waited)
            .finish()
    }
}
