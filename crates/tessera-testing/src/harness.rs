//! # Orchestrator Test Harness
//!
//! Wires mock handlers into an [`Orchestrator`] and collects the full event
//! stream of a run for assertions.

use std::sync::Arc;
use std::time::Duration;

use tessera_core::{CapabilityName, HandlerId, Plan, StepId};
use tessera_runtime::{
    Capability, ConcurrencyLimit, Orchestrator, OrchestratorConfig, OrchestratorResult,
    PlanOutcome, StreamEvent,
};

use crate::mock_handlers::MockHandler;

/// Builder for a [`TestHarness`].
pub struct TestHarnessBuilder {
    config: OrchestratorConfig,
    capabilities: Vec<Capability>,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            capabilities: Vec::new(),
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Register `handler` as the primary handler for `capability`.
    pub fn handler(self, capability: &str, handler: MockHandler) -> Self {
        self.handler_with(capability, "primary", 0, usize::MAX, handler)
    }

    /// Register `handler` with an explicit id, priority and concurrency
    /// ceiling. `usize::MAX` keeps the default ceiling.
    pub fn handler_with(
        mut self,
        capability: &str,
        handler_id: &str,
        priority: i32,
        max_concurrency: usize,
        handler: MockHandler,
    ) -> Self {
        let mut registration = Capability::new(
            CapabilityName::new_unchecked(capability),
            handler.into_handler(),
        )
        .with_handler_id(HandlerId::new_unchecked(handler_id))
        .with_priority(priority);
        if max_concurrency != usize::MAX
            && let Ok(limit) = ConcurrencyLimit::new(max_concurrency)
        {
            registration = registration.with_max_concurrency(limit);
        }
        self.capabilities.push(registration);
        self
    }

    pub fn build(self) -> OrchestratorResult<TestHarness> {
        let orchestrator = self
            .capabilities
            .into_iter()
            .fold(Orchestrator::builder().config(self.config), |b, c| {
                b.capability(c)
            })
            .build()?;
        Ok(TestHarness {
            orchestrator: Arc::new(orchestrator),
        })
    }
}

/// A ready-to-run orchestrator with mock handlers.
pub struct TestHarness {
    orchestrator: Arc<Orchestrator>,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run `plan` to completion and return every event it emitted.
    pub async fn run(&self, plan: Plan) -> OrchestratorResult<RunRecord> {
        let started = tokio::time::Instant::now();
        let (events, outcome) = self.orchestrator.submit(plan)?.collect_all().await?;
        Ok(RunRecord {
            events,
            outcome,
            elapsed: started.elapsed(),
        })
    }
}

/// Events and outcome of one harness run.
#[derive(Debug)]
pub struct RunRecord {
    pub events: Vec<StreamEvent>,
    pub outcome: PlanOutcome,
    pub elapsed: Duration,
}

impl RunRecord {
    /// Event names in emission order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(StreamEvent::name).collect()
    }

    /// Index of the first `name` event for `step`.
    pub fn position(&self, name: &str, step: &str) -> Option<usize> {
        self.events.iter().position(|e| {
            e.name() == name && e.step_id().map(StepId::as_str) == Some(step)
        })
    }

    pub fn terminal(&self) -> Option<&StreamEvent> {
        self.events.last().filter(|e| e.is_terminal())
    }
}
