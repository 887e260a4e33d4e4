//! # Tessera Core
//!
//! Plan model, capability handler contract, identifiers and error types for
//! the Tessera orchestrator. The runtime lives in `tessera-runtime`; this
//! crate has no scheduling logic of its own.

pub mod capability;
pub mod context_store;
pub mod error;
pub mod identifiers;
pub mod plan;

pub use capability::{
    CapabilityHandler, HandlerHealth, InvocationContext, OutputRecord, ProgressReporter,
    StepInput, StepOutput,
};
pub use context_store::{ContextStore, ContextStoreError, InMemoryContextStore};
pub use error::{
    ExecutionError, HandlerError, PlanError, PlanResult, RegistryError, RegistryResult, StepError,
    StepResult, TesseraError, TesseraResult,
};
pub use identifiers::{CapabilityName, HandlerId, IdValidationError, PlanId, StepId};
pub use plan::{FallbackPolicy, Plan, PlanBuilder, RetryPolicy, Step, StepBuilder, StepPriority};
