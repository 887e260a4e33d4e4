//! # Chain Executor
//!
//! Runs a leveled plan phase by phase. Every step of a phase is driven
//! concurrently; admission and concurrency limits are left to the task
//! queue. A phase always runs to completion, so when a required step fails
//! its siblings still finish and their records end up in the final
//! snapshot.
//!
//! Plan-level control:
//! - the whole run sits under the plan deadline; on expiry every live
//!   instance is terminated and reported with `step_error`
//! - cancellation is honoured between phases

mod retry;

use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use tessera_core::{
    CapabilityName, ContextStore, ExecutionError, FallbackPolicy, HandlerId, Plan, PlanId,
    StepError, StepId,
};

use crate::buffer::{ResultBuffer, StepFailure};
use crate::config::OrchestratorConfig;
use crate::feedback::{ExecutionSummary, StepOutcome, StepSummary};
use crate::graph::{Phase, PlanGraph};
use crate::lifecycle::LifecycleManager;
use crate::metrics::Recorder;
use crate::queue::TaskQueue;
use crate::registry::CapabilityRegistry;
use crate::streaming::{
    EventEmitter, EventKind, PlanOutcome, StepProgressReporter, outcome_label,
};

/// Shared services a plan execution borrows from the orchestrator.
#[derive(Clone)]
pub(crate) struct ExecutorDeps {
    pub registry: Arc<CapabilityRegistry>,
    pub queue: TaskQueue,
    pub config: Arc<OrchestratorConfig>,
    pub recorder: Recorder,
    pub context_store: Option<Arc<dyn ContextStore>>,
}

struct StepTrack {
    capability: CapabilityName,
    phase: usize,
    required: bool,
    started: Option<Instant>,
    attempts: u32,
    handler_id: Option<HandlerId>,
    outcome: Option<StepOutcome>,
    duration: Duration,
    error: Option<String>,
    reporter: Option<Arc<StepProgressReporter>>,
}

#[derive(Default)]
struct Tracker {
    order: Vec<StepId>,
    steps: HashMap<StepId, StepTrack>,
    current_phase: Option<usize>,
}

/// Executes one plan. Created per submission and consumed by [`run`].
///
/// [`run`]: PlanExecutor::run
pub(crate) struct PlanExecutor {
    plan_id: PlanId,
    fallback: FallbackPolicy,
    plan_timeout: Duration,
    deps: ExecutorDeps,
    lifecycle: Arc<LifecycleManager>,
    buffer: Arc<ResultBuffer>,
    emitter: EventEmitter,
    cancel: CancellationToken,
    outputs: DashMap<StepId, Value>,
    tracker: Mutex<Tracker>,
}

impl PlanExecutor {
    pub(crate) fn new(
        plan: &Plan,
        graph: &PlanGraph,
        deps: ExecutorDeps,
        emitter: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = Arc::new(ResultBuffer::new(deps.config.merge_weights.clone()));

        let mut lifecycle = LifecycleManager::new(plan.id.clone()).with_hook(buffer.clone());
        if let Some(hook) = deps.recorder.lifecycle_hook() {
            lifecycle = lifecycle.with_hook(hook);
        }
        if let Some(store) = &deps.context_store {
            lifecycle = lifecycle.with_context_store(Arc::clone(store));
        }

        let mut tracker = Tracker {
            order: plan.steps.iter().map(|s| s.id.clone()).collect(),
            ..Tracker::default()
        };
        for phase in graph.phases() {
            for step in &phase.steps {
                tracker.steps.insert(
                    step.id.clone(),
                    StepTrack {
                        capability: step.capability.clone(),
                        phase: phase.level,
                        required: step.required,
                        started: None,
                        attempts: 0,
                        handler_id: None,
                        outcome: None,
                        duration: Duration::ZERO,
                        error: None,
                        reporter: None,
                    },
                );
            }
        }

        Self {
            plan_id: plan.id.clone(),
            fallback: plan.fallback,
            plan_timeout: plan.timeout.unwrap_or(deps.config.default_plan_timeout),
            deps,
            lifecycle: Arc::new(lifecycle),
            buffer,
            emitter,
            cancel,
            outputs: DashMap::new(),
            tracker: Mutex::new(tracker),
        }
    }

    pub(crate) async fn run(self, graph: PlanGraph) -> PlanOutcome {
        let span = info_span!("plan", plan_id = %self.plan_id);
        self.execute(graph).instrument(span).await
    }

    async fn execute(&self, graph: PlanGraph) -> PlanOutcome {
        let started = Instant::now();
        let timeout_ms = millis(self.plan_timeout);
        info!(
            steps = graph.step_count(),
            phases = graph.phase_count(),
            timeout_ms,
            "Plan started"
        );
        self.emitter
            .emit(EventKind::Metadata {
                step_count: graph.step_count(),
                phase_count: graph.phase_count(),
                estimated_duration_ms: millis(graph.estimated_duration()),
                timeout_ms,
            })
            .await;

        let phases = graph.into_phases();
        let error = match tokio::time::timeout(self.plan_timeout, self.run_phases(&phases)).await
        {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(_) => {
                self.abort_in_flight("plan timeout").await;
                Some(ExecutionError::PlanTimeout { timeout_ms })
            }
        };

        let snapshot = self.buffer.snapshot_all();
        let degraded = self.buffer.degraded();
        let duration_ms = millis(started.elapsed());
        let label = outcome_label(error.as_ref(), degraded);

        match &error {
            None => {
                info!(degraded, duration_ms, records = snapshot.len(), "Plan completed");
                self.emitter
                    .emit(EventKind::Complete {
                        degraded,
                        duration_ms,
                        snapshot: snapshot.clone(),
                    })
                    .await;
            }
            Some(error) => {
                warn!(outcome = label, error = %error, duration_ms, "Plan ended with error");
                let phase = self.tracker().current_phase;
                self.emitter
                    .emit(EventKind::Error {
                        error: error.clone(),
                        phase,
                        snapshot: snapshot.clone(),
                    })
                    .await;
            }
        }

        self.deps.recorder.plan(label);
        PlanOutcome {
            plan_id: self.plan_id.clone(),
            summary: self.summary(label, degraded, duration_ms),
            error,
            degraded,
            snapshot,
            failures: self.buffer.failures(),
        }
    }

    async fn run_phases(&self, phases: &[Phase]) -> Result<(), ExecutionError> {
        for phase in phases {
            if self.cancel.is_cancelled() {
                info!(phase = phase.level, "Plan cancelled before phase start");
                return Err(ExecutionError::PlanCancelled);
            }
            self.tracker().current_phase = Some(phase.level);

            debug!(phase = phase.level, steps = phase.steps.len(), "Phase started");
            self.emitter
                .emit(EventKind::PhaseStart {
                    phase: phase.level,
                    steps: phase.step_ids(),
                })
                .await;

            let mut running: FuturesUnordered<_> = phase
                .steps
                .iter()
                .map(|step| self.run_step(phase.level, step))
                .collect();

            let (mut completed, mut failed) = (0, 0);
            let mut required_failure = None;
            while let Some((step, result)) = running.next().await {
                match result {
                    Ok(()) => completed += 1,
                    Err(error) => {
                        failed += 1;
                        self.buffer.record_failure(StepFailure {
                            step_id: step.id.clone(),
                            capability: step.capability.clone(),
                            required: step.required,
                            error: error.clone(),
                        });
                        if step.required && required_failure.is_none() {
                            required_failure = Some(ExecutionError::RequiredStepFailed {
                                step: step.id.clone(),
                                source: error,
                            });
                        }
                    }
                }
            }
            drop(running);

            self.emitter
                .emit(EventKind::PhaseComplete {
                    phase: phase.level,
                    completed,
                    failed,
                })
                .await;
            debug!(phase = phase.level, completed, failed, "Phase complete");

            if let Some(error) = required_failure {
                return Err(error);
            }
        }

        if self.cancel.is_cancelled() {
            return Err(ExecutionError::PlanCancelled);
        }
        Ok(())
    }

    /// Terminate live instances and close every started step with a
    /// `step_error`, in declaration order.
    async fn abort_in_flight(&self, reason: &str) {
        let terminated = self.lifecycle.terminate_all(reason);
        debug!(instances = terminated.len(), reason, "Terminated live instances");

        let open: Vec<(StepId, usize, u32, bool)> = {
            let mut tracker = self.tracker();
            let Tracker { order, steps, .. } = &mut *tracker;
            order
                .iter()
                .filter_map(|id| {
                    let track = steps.get_mut(id)?;
                    let started = track.started?;
                    if track.outcome.is_some() {
                        return None;
                    }
                    if let Some(reporter) = &track.reporter {
                        reporter.finish();
                    }
                    track.outcome = Some(StepOutcome::Terminated);
                    track.error = Some(reason.to_string());
                    track.duration = started.elapsed();
                    Some((id.clone(), track.phase, track.attempts, track.required))
                })
                .collect()
        };

        for (step_id, phase, attempts, required) in open {
            self.emitter
                .emit(EventKind::StepError {
                    phase,
                    error: StepError::Terminated {
                        step: step_id.clone(),
                        reason: reason.to_string(),
                    },
                    step_id,
                    attempts,
                    required,
                })
                .await;
        }
    }

    fn summary(&self, outcome: &str, degraded: bool, duration_ms: u64) -> ExecutionSummary {
        let tracker = self.tracker();
        let steps = tracker
            .order
            .iter()
            .filter_map(|id| {
                let track = tracker.steps.get(id)?;
                let fallback = if track.started.is_some() {
                    StepOutcome::Terminated
                } else {
                    StepOutcome::Skipped
                };
                Some(StepSummary {
                    step_id: id.clone(),
                    capability: track.capability.clone(),
                    handler_id: track.handler_id.clone(),
                    phase: track.phase,
                    attempts: track.attempts,
                    outcome: track.outcome.unwrap_or(fallback),
                    duration_ms: millis(track.duration),
                    error: track.error.clone(),
                })
            })
            .collect();

        ExecutionSummary {
            plan_id: self.plan_id.clone(),
            outcome: outcome.to_string(),
            degraded,
            duration_ms,
            steps,
        }
    }

    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, step: &StepId, update: impl FnOnce(&mut StepTrack)) {
        if let Some(track) = self.tracker().steps.get_mut(step) {
            update(track);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
