//! Bridges runtime events to the Prometheus collectors in
//! `tessera-observability`. Compiles to no-ops without the `metrics` feature.

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "metrics")]
use tessera_core::{StepError, StepOutput};
#[cfg(feature = "metrics")]
use tessera_observability::OrchestratorMetrics;

use tessera_core::CapabilityName;

use crate::lifecycle::LifecycleHook;
#[cfg(feature = "metrics")]
use crate::lifecycle::{InstanceState, StepInstance};

/// Optional handle to the orchestrator's metrics.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl Recorder {
    #[cfg(feature = "metrics")]
    pub(crate) fn new(metrics: Option<Arc<OrchestratorMetrics>>) -> Self {
        Self { metrics }
    }

    pub(crate) fn plan(&self, _outcome: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_plan(_outcome);
        }
    }

    pub(crate) fn admission_wait(&self, _capability: &CapabilityName, _wait: Duration) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_admission_wait(_capability.as_str(), _wait);
        }
    }

    pub(crate) fn retry(&self, _capability: &CapabilityName) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_retry(_capability.as_str());
        }
    }

    /// Lifecycle hook recording per-step metrics, when metrics are enabled.
    pub(crate) fn lifecycle_hook(&self) -> Option<Arc<dyn LifecycleHook>> {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            return Some(Arc::new(MetricsHook(Arc::clone(metrics))));
        }
        None
    }
}

/// Records step counts, durations and the running gauge.
#[cfg(feature = "metrics")]
pub struct MetricsHook(pub Arc<OrchestratorMetrics>);

#[cfg(feature = "metrics")]
impl MetricsHook {
    /// Leave the running gauge, if the attempt entered it, and count it.
    fn finish(&self, instance: &StepInstance, outcome: &str, elapsed: Duration) {
        let capability = instance.capability.as_str();
        if instance.started_at.is_some() {
            self.0.step_finished(capability);
        }
        self.0.record_attempt(capability, outcome, elapsed);
    }
}

#[cfg(feature = "metrics")]
impl LifecycleHook for MetricsHook {
    fn on_running(&self, instance: &StepInstance) {
        self.0.step_started(instance.capability.as_str());
    }

    fn on_completed(&self, instance: &StepInstance, _output: &StepOutput, elapsed: Duration) {
        self.finish(instance, "completed", elapsed);
    }

    fn on_failed(&self, instance: &StepInstance, error: &StepError, elapsed: Duration) {
        self.finish(instance, error.kind(), elapsed);
    }

    fn on_terminated(&self, instance: &StepInstance, from: InstanceState) {
        let capability = instance.capability.as_str();
        let elapsed = match (instance.started_at, instance.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        // `completing` already left the gauge in `on_completed`.
        if from == InstanceState::Running {
            self.0.step_finished(capability);
        }
        self.0.record_attempt(capability, "terminated", elapsed);
    }
}
