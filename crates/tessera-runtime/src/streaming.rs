//! # Stream Coordinator
//!
//! One bounded, ordered channel per plan execution. The executor is the only
//! producer apart from handler progress reports; the caller's
//! [`PlanHandle`] is the only consumer.
//!
//! Ordering guarantees:
//! - per step: `step_start`, any `step_progress`, then exactly one of
//!   `step_complete` / `step_error`
//! - `phase_complete(n)` follows every step terminal event of phase `n` and
//!   precedes `phase_start(n + 1)`
//! - exactly one terminal event (`complete` or `error`), always last

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use tessera_core::{
    CapabilityName, ExecutionError, HandlerId, PlanId, ProgressReporter, StepError, StepId,
};

use crate::buffer::{ResultRecord, StepFailure};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::feedback::ExecutionSummary;

/// One event on a plan's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub plan_id: PlanId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First event of every plan.
    Metadata {
        step_count: usize,
        phase_count: usize,
        estimated_duration_ms: u64,
        timeout_ms: u64,
    },
    PhaseStart {
        phase: usize,
        steps: Vec<StepId>,
    },
    StepStart {
        phase: usize,
        step_id: StepId,
        capability: CapabilityName,
    },
    /// Handler progress, retries and fallback substitutions.
    StepProgress {
        phase: usize,
        step_id: StepId,
        attempt: u32,
        message: String,
        fraction: Option<f64>,
    },
    StepComplete {
        phase: usize,
        step_id: StepId,
        handler_id: HandlerId,
        attempts: u32,
        duration_ms: u64,
        record_count: usize,
    },
    StepError {
        phase: usize,
        step_id: StepId,
        attempts: u32,
        required: bool,
        error: StepError,
    },
    PhaseComplete {
        phase: usize,
        completed: usize,
        failed: usize,
    },
    Complete {
        degraded: bool,
        duration_ms: u64,
        snapshot: Vec<ResultRecord>,
    },
    Error {
        error: ExecutionError,
        /// Last phase started before the plan ended, if any.
        phase: Option<usize>,
        snapshot: Vec<ResultRecord>,
    },
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Wire name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Metadata { .. } => "metadata",
            Self::PhaseStart { .. } => "phase_start",
            Self::StepStart { .. } => "step_start",
            Self::StepProgress { .. } => "step_progress",
            Self::StepComplete { .. } => "step_complete",
            Self::StepError { .. } => "step_error",
            Self::PhaseComplete { .. } => "phase_complete",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

impl StreamEvent {
    pub fn new(plan_id: PlanId, kind: EventKind) -> Self {
        Self {
            plan_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn step_id(&self) -> Option<&StepId> {
        match &self.kind {
            EventKind::StepStart { step_id, .. }
            | EventKind::StepProgress { step_id, .. }
            | EventKind::StepComplete { step_id, .. }
            | EventKind::StepError { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<usize> {
        match &self.kind {
            EventKind::PhaseStart { phase, .. }
            | EventKind::StepStart { phase, .. }
            | EventKind::StepProgress { phase, .. }
            | EventKind::StepComplete { phase, .. }
            | EventKind::StepError { phase, .. }
            | EventKind::PhaseComplete { phase, .. } => Some(*phase),
            EventKind::Error { phase, .. } => *phase,
            EventKind::Metadata { .. } | EventKind::Complete { .. } => None,
        }
    }
}

/// Producer side of a plan's stream.
#[derive(Clone)]
pub struct EventEmitter {
    plan_id: PlanId,
    tx: mpsc::Sender<StreamEvent>,
    closed: Arc<Mutex<bool>>,
}

impl EventEmitter {
    pub fn channel(plan_id: PlanId, capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let emitter = Self {
            plan_id,
            tx,
            closed: Arc::new(Mutex::new(false)),
        };
        (emitter, rx)
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Send an event, waiting for channel space. Events after the terminal
    /// event are dropped. A vanished receiver is not an error.
    pub async fn emit(&self, kind: EventKind) -> bool {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if *closed {
                trace!(plan_id = %self.plan_id, event = kind.name(), "Dropped event after terminal");
                return false;
            }
            if kind.is_terminal() {
                *closed = true;
            }
        }
        self.tx
            .send(StreamEvent::new(self.plan_id.clone(), kind))
            .await
            .is_ok()
    }

    /// Send without waiting; the event is dropped when the channel is full.
    pub fn try_emit(&self, kind: EventKind) -> bool {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        match self
            .tx
            .try_send(StreamEvent::new(self.plan_id.clone(), kind))
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                trace!(plan_id = %self.plan_id, event = event.name(), "Stream full, dropped event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forwards handler progress as `step_progress` until the step's terminal
/// event is about to be sent.
pub struct StepProgressReporter {
    emitter: EventEmitter,
    phase: usize,
    step_id: StepId,
    attempt: u32,
    finished: Mutex<bool>,
}

impl StepProgressReporter {
    pub fn new(emitter: EventEmitter, phase: usize, step_id: StepId, attempt: u32) -> Self {
        Self {
            emitter,
            phase,
            step_id,
            attempt,
            finished: Mutex::new(false),
        }
    }

    /// Stop forwarding. Reports in flight complete before this returns.
    pub fn finish(&self) {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

impl ProgressReporter for StepProgressReporter {
    fn report(&self, message: String, fraction: Option<f64>) {
        let finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if *finished {
            return;
        }
        self.emitter.try_emit(EventKind::StepProgress {
            phase: self.phase,
            step_id: self.step_id.clone(),
            attempt: self.attempt,
            message,
            fraction,
        });
    }
}

/// Final result of a plan execution.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub plan_id: PlanId,
    pub error: Option<ExecutionError>,
    pub degraded: bool,
    pub snapshot: Vec<ResultRecord>,
    pub failures: Vec<StepFailure>,
    pub summary: ExecutionSummary,
}

impl PlanOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// `completed`, `degraded`, or the error's outcome label.
    pub fn outcome_label(&self) -> &'static str {
        outcome_label(self.error.as_ref(), self.degraded)
    }

    pub fn into_result(self) -> Result<Vec<ResultRecord>, ExecutionError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.snapshot),
        }
    }
}

pub(crate) fn outcome_label(error: Option<&ExecutionError>, degraded: bool) -> &'static str {
    match error {
        Some(error) => error.outcome(),
        None if degraded => "degraded",
        None => "completed",
    }
}

/// Caller side of a submitted plan: a [`Stream`] of [`StreamEvent`]s that
/// ends after the terminal event.
///
/// Dropping the handle does not cancel the plan; call [`PlanHandle::cancel`].
#[derive(Debug)]
pub struct PlanHandle {
    plan_id: PlanId,
    events: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
    join: JoinHandle<PlanOutcome>,
    terminal_seen: bool,
}

impl PlanHandle {
    pub(crate) fn new(
        plan_id: PlanId,
        events: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
        join: JoinHandle<PlanOutcome>,
    ) -> Self {
        Self {
            plan_id,
            events: ReceiverStream::new(events),
            cancel,
            join,
            terminal_seen: false,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Ask the plan to stop before its next phase.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain remaining events and return the outcome.
    pub async fn wait(mut self) -> OrchestratorResult<PlanOutcome> {
        while self.next().await.is_some() {}
        self.join
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))
    }

    /// Collect every remaining event, then the outcome.
    pub async fn collect_all(mut self) -> OrchestratorResult<(Vec<StreamEvent>, PlanOutcome)> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        let outcome = self
            .join
            .await
            .map_err(|e| OrchestratorError::Join(e.to_string()))?;
        Ok((events, outcome))
    }
}

impl Stream for PlanHandle {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminal_seen {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.events).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                this.terminal_seen = event.is_terminal();
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> PlanId {
        PlanId::new_unchecked("plan-1")
    }

    #[test]
    fn test_event_wire_shape() {
        let event = StreamEvent::new(
            plan(),
            EventKind::StepStart {
                phase: 0,
                step_id: StepId::new_unchecked("a"),
                capability: CapabilityName::new_unchecked("search"),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step_start");
        assert_eq!(value["plan_id"], "plan-1");
        assert_eq!(value["step_id"], "a");
        assert_eq!(value["phase"], json!(0));

        let back: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_accessors() {
        let error = StreamEvent::new(
            plan(),
            EventKind::Error {
                error: ExecutionError::PlanCancelled,
                phase: Some(2),
                snapshot: Vec::new(),
            },
        );
        assert!(error.is_terminal());
        assert_eq!(error.name(), "error");
        assert_eq!(error.phase(), Some(2));
        assert!(error.step_id().is_none());
    }

    #[tokio::test]
    async fn test_nothing_emitted_after_terminal() {
        let (emitter, mut rx) = EventEmitter::channel(plan(), 8);
        assert!(
            emitter
                .emit(EventKind::PhaseStart {
                    phase: 0,
                    steps: Vec::new()
                })
                .await
        );
        assert!(
            emitter
                .emit(EventKind::Complete {
                    degraded: false,
                    duration_ms: 1,
                    snapshot: Vec::new()
                })
                .await
        );
        assert!(emitter.is_closed());
        assert!(
            !emitter
                .emit(EventKind::PhaseComplete {
                    phase: 0,
                    completed: 0,
                    failed: 0
                })
                .await
        );
        drop(emitter);

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(names, ["phase_start", "complete"]);
    }

    #[tokio::test]
    async fn test_progress_stops_after_finish() {
        let (emitter, mut rx) = EventEmitter::channel(plan(), 8);
        let reporter = StepProgressReporter::new(emitter, 0, StepId::new_unchecked("a"), 1);

        reporter.report("half".to_string(), Some(0.5));
        reporter.finish();
        reporter.report("late".to_string(), None);
        drop(reporter);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            EventKind::StepProgress { ref message, fraction: Some(f), .. } if message == "half" && f == 0.5
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_try_emit_drops_when_full() {
        let (emitter, _rx) = EventEmitter::channel(plan(), 1);
        let progress = || EventKind::StepProgress {
            phase: 0,
            step_id: StepId::new_unchecked("a"),
            attempt: 1,
            message: "tick".to_string(),
            fraction: None,
        };
        assert!(emitter.try_emit(progress()));
        assert!(!emitter.try_emit(progress()));
    }

    #[tokio::test]
    async fn test_handle_stream_ends_at_terminal() {
        let (emitter, rx) = EventEmitter::channel(plan(), 8);
        let cancel = CancellationToken::new();
        let summary = ExecutionSummary {
            plan_id: plan(),
            outcome: "completed".to_string(),
            degraded: false,
            duration_ms: 0,
            steps: Vec::new(),
        };
        let join = tokio::spawn(async move {
            emitter
                .emit(EventKind::Complete {
                    degraded: false,
                    duration_ms: 0,
                    snapshot: Vec::new(),
                })
                .await;
            PlanOutcome {
                plan_id: PlanId::new_unchecked("plan-1"),
                error: None,
                degraded: false,
                snapshot: Vec::new(),
                failures: Vec::new(),
                summary,
            }
        });

        let handle = PlanHandle::new(plan(), rx, cancel, join);
        let (events, outcome) = handle.collect_all().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(outcome.is_success());
        assert_eq!(outcome.outcome_label(), "completed");
    }
}
