//! # Capability Handler Contract
//!
//! Every unit of work a step performs is delegated to a [`CapabilityHandler`]
//! trait object. The orchestrator knows nothing about what a handler does;
//! it only sees typed input, typed output, a deadline and a cancellation
//! token.
//!
//! Handlers report structured failures through [`HandlerError`]. Any error,
//! a panic, or a missed deadline counts as a failed attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context_store::ContextStore;
use crate::error::HandlerError;
use crate::identifiers::{CapabilityName, HandlerId, PlanId, StepId};

/// Work performed on behalf of one capability.
///
/// Implementations must be cheap to share; one instance serves every
/// concurrent invocation for its descriptor.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Run one attempt. The orchestrator enforces `ctx.timeout` itself, but
    /// long-running handlers should also watch `ctx.cancellation()`.
    async fn invoke(
        &self,
        input: StepInput,
        ctx: InvocationContext,
    ) -> Result<StepOutput, HandlerError>;

    /// Liveness probe used by the health monitor.
    async fn health_check(&self) -> HandlerHealth {
        HandlerHealth::Healthy
    }
}

/// Result of a handler health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerHealth {
    Healthy,
    Unhealthy { reason: String },
}

impl HandlerHealth {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self::Unhealthy {
            reason: reason.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Input handed to a handler for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    /// The step's declared payload.
    pub payload: Value,
    /// `data` outputs of completed dependencies, keyed by step id.
    #[serde(default)]
    pub upstream: BTreeMap<StepId, Value>,
}

impl StepInput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            upstream: BTreeMap::new(),
        }
    }

    pub fn with_upstream(mut self, step: StepId, data: Value) -> Self {
        self.upstream.insert(step, data);
        self
    }

    pub fn upstream(&self, step: &str) -> Option<&Value> {
        self.upstream.get(step)
    }
}

/// One scored record destined for the result buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub key: String,
    pub payload: Value,
    pub score: f64,
}

impl OutputRecord {
    pub fn new(key: impl Into<String>, payload: Value, score: f64) -> Self {
        Self {
            key: key.into(),
            payload,
            score,
        }
    }
}

/// What a handler returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Records merged into the result buffer.
    #[serde(default)]
    pub records: Vec<OutputRecord>,
    /// Free-form data passed to dependent steps.
    #[serde(default)]
    pub data: Value,
}

impl StepOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            records: Vec::new(),
            data,
        }
    }

    pub fn record(mut self, key: impl Into<String>, payload: Value, score: f64) -> Self {
        self.records.push(OutputRecord::new(key, payload, score));
        self
    }
}

/// Receives intermediate progress published by a running handler.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: String, fraction: Option<f64>);
}

/// Per-attempt context passed to [`CapabilityHandler::invoke`].
#[derive(Clone)]
pub struct InvocationContext {
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub capability: CapabilityName,
    pub handler_id: HandlerId,
    /// 1-based attempt number across retries and fallback.
    pub attempt: u32,
    pub timeout: Duration,
    cancellation: CancellationToken,
    context_store: Option<Arc<dyn ContextStore>>,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl InvocationContext {
    pub fn new(
        plan_id: PlanId,
        step_id: StepId,
        capability: CapabilityName,
        handler_id: HandlerId,
        attempt: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            plan_id,
            step_id,
            capability,
            handler_id,
            attempt,
            timeout,
            cancellation: CancellationToken::new(),
            context_store: None,
            progress: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// Fires when the attempt is terminated or the plan times out.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn context_store(&self) -> Option<&Arc<dyn ContextStore>> {
        self.context_store.as_ref()
    }

    /// Publish a progress update. A no-op when nobody listens.
    pub fn report_progress(&self, message: impl Into<String>, fraction: Option<f64>) {
        if let Some(progress) = &self.progress {
            progress.report(message.into(), fraction.map(|f| f.clamp(0.0, 1.0)));
        }
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("plan_id", &self.plan_id)
            .field("step_id", &self.step_id)
            .field("capability", &self.capability)
            .field("handler_id", &self.handler_id)
            .field("attempt", &self.attempt)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.is_cancelled())
            .field("context_store", &self.context_store.is_some())
            .finish()
    }
}
