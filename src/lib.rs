//! # Tessera
//!
//! Tessera executes multi-step plans against a pool of capability handlers.
//! A plan is a set of steps with dependencies; Tessera levels it into
//! phases, admits each step under per-handler concurrency limits, retries
//! and falls back on failure, merges handler output into a deduplicated
//! result set, and streams ordered progress events while it runs.
//!
//! ## Core Components
//!
//! - **[CapabilityHandler]**: the contract every tool or backend implements
//! - **[Plan], [Step]**: what to run and in which order
//! - **[Orchestrator]**: registry, admission queue and health probes shared
//!   by every plan
//! - **[PlanHandle]**: the event stream and final [PlanOutcome] of one run
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera::prelude::*;
//! use serde_json::json;
//!
//! struct Search;
//!
//! #[async_trait::async_trait]
//! impl CapabilityHandler for Search {
//!     async fn invoke(
//!         &self,
//!         input: StepInput,
//!         _ctx: InvocationContext,
//!     ) -> Result<StepOutput, HandlerError> {
//!         Ok(StepOutput::empty().record("doc-1", input.payload, 0.9))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let orchestrator = Orchestrator::builder()
//!     .capability(Capability::new(
//!         CapabilityName::parse("search").unwrap(),
//!         Arc::new(Search),
//!     ))
//!     .build()
//!     .unwrap();
//!
//! let plan = Plan::builder()
//!     .step(Step::builder("find", "search").input(json!({"q": "rust"})))
//!     .build()
//!     .unwrap();
//!
//! let outcome = orchestrator.run(plan).await.unwrap();
//! assert!(outcome.is_success());
//! assert_eq!(outcome.snapshot[0].key, "doc-1");
//! # });
//! ```

// ============================================================================
// Module aliases for namespaced access
// ============================================================================

pub use tessera_core as core;
pub use tessera_observability as observability;
pub use tessera_runtime as runtime;

// ============================================================================
// Plan model and handler contract
// ============================================================================

pub use tessera_core::{
    CapabilityHandler, ContextStore, ContextStoreError, FallbackPolicy, HandlerHealth,
    InMemoryContextStore, InvocationContext, OutputRecord, Plan, PlanBuilder, ProgressReporter,
    RetryPolicy, Step, StepBuilder, StepInput, StepOutput, StepPriority,
};

// ============================================================================
// Identifiers
// ============================================================================

pub use tessera_core::{CapabilityName, HandlerId, IdValidationError, PlanId, StepId};

// ============================================================================
// Errors
// ============================================================================

pub use tessera_core::{
    ExecutionError, HandlerError, PlanError, RegistryError, StepError, TesseraError,
    TesseraResult,
};
pub use tessera_runtime::{ConfigError, OrchestratorError, OrchestratorResult};

// ============================================================================
// Runtime
// ============================================================================

pub use tessera_runtime::{
    Capability, CapabilityDescriptor, CapabilityRegistry, EventKind, ExecutionSummary,
    FeedbackSink, LoggingFeedbackSink, MergeWeights, Orchestrator, OrchestratorBuilder,
    OrchestratorConfig, PlanGraph, PlanHandle, PlanOutcome, ResultRecord, StepOutcome,
    StreamEvent,
};

// ============================================================================
// Observability
// ============================================================================

pub use tessera_observability::{LogFormat, ObservabilityConfig, init_observability};

#[cfg(feature = "metrics")]
pub use tessera_observability::OrchestratorMetrics;

/// Everything needed to write a handler and run a plan.
pub mod prelude {
    pub use crate::{
        Capability, CapabilityHandler, CapabilityName, EventKind, FallbackPolicy, HandlerError,
        HandlerHealth, InvocationContext, Orchestrator, OrchestratorConfig, Plan, PlanOutcome,
        RetryPolicy, Step, StepInput, StepOutput, StepPriority, StreamEvent,
    };
}
