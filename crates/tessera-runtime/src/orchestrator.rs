//! # Orchestrator
//!
//! Entry point tying the runtime together: one registry, one task queue and
//! one health monitor shared by every plan, with a fresh executor, result
//! buffer, lifecycle manager and event stream per submission.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use tessera_core::{Plan, Step, CapabilityName};
//! # use tessera_runtime::{Capability, Orchestrator};
//! # async fn demo(handler: Arc<dyn tessera_core::CapabilityHandler>) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::builder().build()?;
//! orchestrator.register(Capability::new(CapabilityName::parse("search")?, handler))?;
//!
//! let plan = Plan::builder()
//!     .step(Step::builder("lookup", "search"))
//!     .build()?;
//! let outcome = orchestrator.run(plan).await?;
//! println!("{} records", outcome.snapshot.len());
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use tessera_observability::OrchestratorMetrics;

use tessera_core::{CapabilityName, ContextStore, Plan};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::executor::{ExecutorDeps, PlanExecutor};
use crate::feedback::{self, FeedbackSink};
use crate::graph::PlanGraph;
use crate::health::{HealthMonitor, HealthMonitorHandle, ProbeReport};
use crate::metrics::Recorder;
use crate::queue::{QueueMetrics, TaskQueue};
use crate::registry::{Capability, CapabilityDescriptor, CapabilityRegistry};
use crate::streaming::{EventEmitter, PlanHandle, PlanOutcome};

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<OrchestratorConfig>,
    capabilities: Vec<Capability>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    context_store: Option<Arc<dyn ContextStore>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn feedback(mut self, sink: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(sink);
        self
    }

    pub fn context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    /// Record into existing collectors instead of creating new ones.
    #[cfg(feature = "metrics")]
    pub fn metrics(mut self, metrics: Arc<OrchestratorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> OrchestratorResult<Orchestrator> {
        let config = Arc::new(self.config.unwrap_or_default());
        let registry = Arc::new(CapabilityRegistry::new());
        for capability in self.capabilities {
            registry.register(capability)?;
        }

        #[cfg(feature = "metrics")]
        let metrics = match self.metrics {
            Some(metrics) => Some(metrics),
            None if config.observability.metrics_enabled => Some(Arc::new(
                OrchestratorMetrics::new(&config.observability.namespace)?,
            )),
            None => None,
        };

        #[cfg(feature = "metrics")]
        let recorder = Recorder::new(metrics.clone());
        #[cfg(not(feature = "metrics"))]
        let recorder = Recorder::default();

        Ok(Orchestrator {
            queue: TaskQueue::new(config.admission_timeout),
            registry,
            config,
            recorder,
            #[cfg(feature = "metrics")]
            metrics,
            feedback: self.feedback,
            context_store: self.context_store,
            health: Mutex::new(None),
        })
    }
}

/// Capability-aware plan orchestrator.
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    queue: TaskQueue,
    config: Arc<OrchestratorConfig>,
    recorder: Recorder,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<OrchestratorMetrics>>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    context_store: Option<Arc<dyn ContextStore>>,
    health: Mutex<Option<HealthMonitorHandle>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Build from `TESSERA_*` environment variables.
    pub fn from_env() -> OrchestratorResult<Self> {
        Self::builder().config(OrchestratorConfig::from_env()?).build()
    }

    pub fn register(&self, capability: Capability) -> OrchestratorResult<Arc<CapabilityDescriptor>> {
        Ok(self.registry.register(capability)?)
    }

    /// Validate `plan` and start executing it on the current tokio runtime.
    ///
    /// Validation failures are returned here and nothing is admitted.
    pub fn submit(&self, plan: Plan) -> OrchestratorResult<PlanHandle> {
        let graph = match PlanGraph::build(&plan, &self.registry, self.config.default_step_timeout)
        {
            Ok(graph) => graph,
            Err(e) => {
                warn!(plan_id = %plan.id, error = %e, "Plan rejected");
                return Err(e.into());
            }
        };
        let runtime = Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;

        let cancel = CancellationToken::new();
        let (emitter, events) =
            EventEmitter::channel(plan.id.clone(), self.config.event_channel_capacity.get());
        let executor = PlanExecutor::new(&plan, &graph, self.deps(), emitter, cancel.clone());
        debug!(
            plan_id = %plan.id,
            steps = graph.step_count(),
            phases = graph.phase_count(),
            "Plan accepted"
        );

        let sink = self.feedback.clone();
        let join = runtime.spawn(async move {
            let outcome = executor.run(graph).await;
            if let Some(sink) = sink {
                feedback::dispatch(sink, outcome.summary.clone());
            }
            outcome
        });

        Ok(PlanHandle::new(plan.id, events, cancel, join))
    }

    /// Submit `plan` and wait for its outcome.
    pub async fn run(&self, plan: Plan) -> OrchestratorResult<PlanOutcome> {
        self.submit(plan)?.wait().await
    }

    /// Start the background health monitor. A second call is a no-op.
    pub fn start(&self) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if health.is_some() {
            return;
        }
        *health = Some(self.health_monitor().start());
        info!(
            interval_ms = self.config.health_probe_interval.as_millis() as u64,
            "Health monitor started"
        );
    }

    /// Run one probe round immediately.
    pub async fn probe_health(&self) -> ProbeReport {
        self.health_monitor().probe_all().await
    }

    /// Stop the health monitor and close the task queue. Waiting steps fail
    /// as terminated.
    pub async fn shutdown(&self) {
        let health = self
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = health {
            handle.stop().await;
        }
        self.queue.close();
        info!("Orchestrator shut down");
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue_metrics(&self, capability: &CapabilityName) -> QueueMetrics {
        self.queue.metrics_for(capability)
    }

    pub fn global_queue_metrics(&self) -> QueueMetrics {
        self.queue.global_metrics()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<OrchestratorMetrics>> {
        self.metrics.as_ref()
    }

    fn deps(&self) -> ExecutorDeps {
        ExecutorDeps {
            registry: Arc::clone(&self.registry),
            queue: self.queue.clone(),
            config: Arc::clone(&self.config),
            recorder: self.recorder.clone(),
            context_store: self.context_store.clone(),
        }
    }

    fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.registry),
            self.queue.clone(),
            self.config.health_probe_interval,
            self.config.health_probe_timeout,
        )
    }
}
