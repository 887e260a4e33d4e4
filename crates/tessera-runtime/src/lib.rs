//! # Tessera Runtime
//!
//! Executes [`Plan`](tessera_core::Plan)s against registered capability
//! handlers. A plan is leveled into phases by [`PlanGraph`]; each phase's
//! steps compete for admission on the shared [`TaskQueue`], run under the
//! [`LifecycleManager`], and feed a per-plan [`ResultBuffer`]. Progress is
//! streamed to the caller through a [`PlanHandle`].
//!
//! ## Modules
//!
//! - [`registry`]: capability descriptors and handler selection
//! - [`queue`]: priority admission with per-descriptor concurrency limits
//! - [`lifecycle`]: step instance state machine and hooks
//! - [`graph`]: dependency validation and phase leveling
//! - [`buffer`]: deduplicated, weighted result merging
//! - [`streaming`]: ordered execution events and plan handles
//! - [`health`]: periodic handler probes
//! - [`feedback`]: post-run execution summaries
//! - [`orchestrator`]: the facade tying the above together

pub mod buffer;
pub mod config;
pub mod error;
mod executor;
pub mod feedback;
pub mod graph;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod streaming;

pub use buffer::{ResultBuffer, ResultRecord, StepFailure};
pub use config::{
    ChannelCapacity, ConcurrencyLimit, ConfigError, MergeWeight, MergeWeights,
    OrchestratorConfig, OrchestratorConfigBuilder,
};
pub use error::{OrchestratorError, OrchestratorResult};
pub use feedback::{
    ExecutionSummary, FeedbackError, FeedbackSink, LoggingFeedbackSink, StepOutcome, StepSummary,
};
pub use graph::{Phase, PlanGraph};
pub use health::{HealthMonitor, HealthMonitorHandle, ProbeReport};
pub use lifecycle::{
    InstanceHandle, InstanceId, InstanceState, LifecycleError, LifecycleEvent, LifecycleHook,
    LifecycleManager, LifecycleResult, StepInstance,
};
#[cfg(feature = "metrics")]
pub use metrics::MetricsHook;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use queue::{
    AdmissionPermit, AdmissionRequest, QueueError, QueueMetrics, QueueResult, TaskQueue,
};
pub use registry::{Capability, CapabilityDescriptor, CapabilityRegistry, DescriptorKey};
pub use streaming::{
    EventEmitter, EventKind, PlanHandle, PlanOutcome, StepProgressReporter, StreamEvent,
};
