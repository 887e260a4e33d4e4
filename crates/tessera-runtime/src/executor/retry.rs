//! Failure policy for one step: retries with exponential backoff on the
//! selected handler, then at most one attempt on an alternate handler.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use tessera_core::{
    FallbackPolicy, ProgressReporter, Step, StepError, StepInput, StepOutput, StepResult,
};

use super::{PlanExecutor, millis};
use crate::feedback::StepOutcome;
use crate::queue::{AdmissionRequest, QueueError};
use crate::registry::CapabilityDescriptor;
use crate::streaming::{EventKind, StepProgressReporter};

impl PlanExecutor {
    /// Drive `step` to a terminal event. Returns the step alongside its
    /// result so the phase loop can attribute failures.
    pub(super) async fn run_step<'a>(
        &self,
        phase: usize,
        step: &'a Step,
    ) -> (&'a Step, StepResult<()>) {
        let span = info_span!(
            "step",
            step_id = %step.id,
            capability = %step.capability,
            phase
        );
        let result = self.drive_step(phase, step).instrument(span).await;
        (step, result)
    }

    async fn drive_step(&self, phase: usize, step: &Step) -> StepResult<()> {
        let started = Instant::now();
        self.emitter
            .emit(EventKind::StepStart {
                phase,
                step_id: step.id.clone(),
                capability: step.capability.clone(),
            })
            .await;
        self.track(&step.id, |t| t.started = Some(started));

        let input = self.upstream_input(step);
        let descriptor = match self.deps.registry.select(&step.capability) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let error = StepError::Terminated {
                    step: step.id.clone(),
                    reason: e.to_string(),
                };
                return self.finish_failure(phase, step, 0, started, error).await;
            }
        };

        let policy = &step.retry_policy;
        let mut attempts = 0;
        let mut error = loop {
            attempts += 1;
            match self.attempt(phase, step, &descriptor, attempts, &input).await {
                Ok(output) => {
                    return self
                        .finish_success(phase, step, &descriptor, attempts, started, output)
                        .await;
                }
                Err(error) if error.is_retryable() && attempts <= policy.max_retries => {
                    let delay = policy.backoff_for(attempts).min(self.deps.config.max_backoff);
                    warn!(
                        attempt = attempts,
                        retry_in_ms = millis(delay),
                        error = %error,
                        "Step attempt failed, retrying"
                    );
                    self.deps.recorder.retry(&step.capability);
                    self.emitter
                        .emit(EventKind::StepProgress {
                            phase,
                            step_id: step.id.clone(),
                            attempt: attempts,
                            message: format!(
                                "attempt {attempts} failed ({}), retrying in {}ms",
                                error.kind(),
                                millis(delay)
                            ),
                            fraction: None,
                        })
                        .await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => break error,
            }
        };

        if error.is_retryable()
            && self.fallback == FallbackPolicy::AlternateHandler
            && let Some(alternate) = self.deps.registry.alternate(descriptor.key())
        {
            attempts += 1;
            info!(
                from = %descriptor.handler_id(),
                to = %alternate.handler_id(),
                "Falling back to alternate handler"
            );
            self.deps.recorder.retry(&step.capability);
            self.emitter
                .emit(EventKind::StepProgress {
                    phase,
                    step_id: step.id.clone(),
                    attempt: attempts,
                    message: format!("falling back to handler '{}'", alternate.handler_id()),
                    fraction: None,
                })
                .await;
            match self.attempt(phase, step, &alternate, attempts, &input).await {
                Ok(output) => {
                    return self
                        .finish_success(phase, step, &alternate, attempts, started, output)
                        .await;
                }
                Err(fallback_error) => error = fallback_error,
            }
        }

        self.finish_failure(phase, step, attempts, started, error)
            .await
    }

    /// One admission plus one handler invocation.
    async fn attempt(
        &self,
        phase: usize,
        step: &Step,
        descriptor: &Arc<CapabilityDescriptor>,
        attempt: u32,
        input: &StepInput,
    ) -> StepResult<StepOutput> {
        self.track(&step.id, |t| {
            t.attempts = attempt;
            t.handler_id = Some(descriptor.handler_id().clone());
        });

        let instance = self.lifecycle.create(&step.id, attempt, descriptor);
        let request = AdmissionRequest::new(step.id.clone(), Arc::clone(descriptor), step.priority);
        let permit = match self.deps.queue.enqueue(request).await {
            Ok(permit) => permit,
            Err(QueueError::AdmissionTimeout { waited_ms, .. }) => {
                let error = StepError::AdmissionTimeout {
                    step: step.id.clone(),
                    capability: step.capability.clone(),
                    waited_ms,
                };
                return self
                    .lifecycle
                    .fail(instance, error, Duration::from_millis(waited_ms));
            }
            Err(QueueError::Closed) => {
                let reason = "task queue closed";
                // The instance may already be terminated by a plan abort.
                let _ = self.lifecycle.terminate(instance, reason);
                return Err(StepError::Terminated {
                    step: step.id.clone(),
                    reason: reason.to_string(),
                });
            }
        };

        let waited = permit.waited();
        self.deps.recorder.admission_wait(&step.capability, waited);
        debug!(
            attempt,
            handler = %descriptor.handler_id(),
            waited_ms = millis(waited),
            "Step admitted"
        );

        let reporter = Arc::new(StepProgressReporter::new(
            self.emitter.clone(),
            phase,
            step.id.clone(),
            attempt,
        ));
        self.track(&step.id, |t| t.reporter = Some(Arc::clone(&reporter)));

        let timeout = step.effective_timeout(self.deps.config.default_step_timeout);
        let progress: Arc<dyn ProgressReporter> = reporter.clone();
        let result = match self
            .lifecycle
            .spawn(instance, permit, input.clone(), timeout, Some(progress))
        {
            Ok(handle) => handle.outcome().await,
            Err(e) => Err(StepError::Terminated {
                step: step.id.clone(),
                reason: e.to_string(),
            }),
        };
        reporter.finish();
        result
    }

    async fn finish_success(
        &self,
        phase: usize,
        step: &Step,
        descriptor: &CapabilityDescriptor,
        attempts: u32,
        started: Instant,
        output: StepOutput,
    ) -> StepResult<()> {
        let duration = started.elapsed();
        let record_count = output.records.len();
        self.outputs.insert(step.id.clone(), output.data);

        self.emitter
            .emit(EventKind::StepComplete {
                phase,
                step_id: step.id.clone(),
                handler_id: descriptor.handler_id().clone(),
                attempts,
                duration_ms: millis(duration),
                record_count,
            })
            .await;
        self.track(&step.id, |t| {
            t.outcome = Some(StepOutcome::Completed);
            t.attempts = attempts;
            t.duration = duration;
        });
        info!(
            attempts,
            handler = %descriptor.handler_id(),
            duration_ms = millis(duration),
            records = record_count,
            "Step completed"
        );
        Ok(())
    }

    async fn finish_failure(
        &self,
        phase: usize,
        step: &Step,
        attempts: u32,
        started: Instant,
        error: StepError,
    ) -> StepResult<()> {
        let duration = started.elapsed();
        self.emitter
            .emit(EventKind::StepError {
                phase,
                step_id: step.id.clone(),
                attempts,
                required: step.required,
                error: error.clone(),
            })
            .await;
        let outcome = if error.is_retryable() {
            StepOutcome::Failed
        } else {
            StepOutcome::Terminated
        };
        self.track(&step.id, |t| {
            t.outcome = Some(outcome);
            t.attempts = attempts;
            t.duration = duration;
            t.error = Some(error.to_string());
        });
        warn!(
            attempts,
            required = step.required,
            error = %error,
            "Step failed permanently"
        );
        Err(error)
    }

    /// The step's own input plus the `data` of every completed dependency.
    fn upstream_input(&self, step: &Step) -> StepInput {
        step.depends_on
            .iter()
            .fold(StepInput::new(step.input.clone()), |input, dep| {
                match self.outputs.get(dep) {
                    Some(data) => input.with_upstream(dep.clone(), data.value().clone()),
                    None => input,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::*;
    use std::time::Duration;
    use tessera_core::{FallbackPolicy, Plan, RetryPolicy, Step};

    use crate::feedback::StepOutcome;
    use crate::streaming::EventKind;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let plan = Plan::builder()
            .step(
                Step::builder("s", "flaky")
                    .retry(RetryPolicy::new(3, Duration::from_millis(100), 2.0)),
            )
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let (events, outcome) = run_with(plan, flaky_registry(2)).await;

        assert!(outcome.is_success());
        let summary = outcome.summary.step("s").unwrap();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.outcome, StepOutcome::Completed);
        // 100ms + 200ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(300));

        let retries = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::StepProgress { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_then_fallback() {
        let plan = Plan::builder()
            .step(
                Step::builder("s", "flaky")
                    .retry(RetryPolicy::new(1, Duration::from_millis(10), 1.0)),
            )
            .build()
            .unwrap();

        let (events, outcome) = run_with(plan, flaky_registry_with_backup(u32::MAX)).await;

        assert!(outcome.is_success());
        let summary = outcome.summary.step("s").unwrap();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.handler_id.as_ref().unwrap().as_str(), "backup");
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            EventKind::StepProgress { message, .. } if message.contains("falling back")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_disabled_fails_step() {
        let plan = Plan::builder()
            .step(
                Step::builder("s", "flaky")
                    .retry(RetryPolicy::new(2, Duration::from_millis(10), 2.0)),
            )
            .fallback(FallbackPolicy::None)
            .build()
            .unwrap();

        let (events, outcome) = run_with(plan, flaky_registry_with_backup(u32::MAX)).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.summary.step("s").unwrap().attempts, 3);
        let step_error = events
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::StepError { attempts, .. } => Some(*attempts),
                _ => None,
            })
            .unwrap();
        assert_eq!(step_error, 3);
    }
}
