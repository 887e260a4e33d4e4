//! Post-execution feedback.
//!
//! After a plan's terminal event the orchestrator hands an
//! [`ExecutionSummary`] to the configured [`FeedbackSink`] on a detached
//! task. Sink failures are logged and never change the plan outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use tessera_core::{CapabilityName, HandlerId, PlanId, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
    Terminated,
    /// Never started because the plan ended first.
    Skipped,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: StepId,
    pub capability: CapabilityName,
    /// Handler of the last attempt.
    pub handler_id: Option<HandlerId>,
    pub phase: usize,
    pub attempts: u32,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Per-plan record of what ran and how it went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_id: PlanId,
    /// `completed`, `degraded`, `failed`, `timeout` or `cancelled`.
    pub outcome: String,
    pub degraded: bool,
    pub duration_ms: u64,
    /// In plan declaration order.
    pub steps: Vec<StepSummary>,
}

impl ExecutionSummary {
    pub fn step(&self, id: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.step_id.as_str() == id)
    }

    pub fn total_attempts(&self) -> u32 {
        self.steps.iter().map(|s| s.attempts).sum()
    }

    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("Feedback sink unavailable: {0}")]
    Unavailable(String),

    #[error("Feedback rejected: {0}")]
    Rejected(String),
}

/// Receiver of execution summaries, typically a pattern store.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record(&self, summary: ExecutionSummary) -> Result<(), FeedbackError>;
}

/// Writes each summary to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFeedbackSink;

#[async_trait]
impl FeedbackSink for LoggingFeedbackSink {
    async fn record(&self, summary: ExecutionSummary) -> Result<(), FeedbackError> {
        info!(
            plan_id = %summary.plan_id,
            outcome = %summary.outcome,
            degraded = summary.degraded,
            duration_ms = summary.duration_ms,
            steps = summary.steps.len(),
            attempts = summary.total_attempts(),
            "Plan execution summary"
        );
        Ok(())
    }
}

/// Deliver `summary` without waiting for the sink.
pub(crate) fn dispatch(sink: Arc<dyn FeedbackSink>, summary: ExecutionSummary) {
    tokio::spawn(async move {
        let plan_id = summary.plan_id.clone();
        if let Err(e) = sink.record(summary).await {
            warn!(%plan_id, error = %e, "Feedback sink failed");
        }
    });
}
