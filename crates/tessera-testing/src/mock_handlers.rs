//! # Mock Handlers for Testing
//!
//! Capability handlers with scripted latency, failures and health, so
//! scheduling behavior can be asserted without real backends.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use tessera_core::{
    CapabilityHandler, HandlerError, HandlerHealth, InvocationContext, StepId, StepInput,
    StepOutput,
};

/// Tracks how many invocations are in flight at once.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest concurrency observed so far.
    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        ProbeGuard(Arc::clone(self))
    }
}

struct ProbeGuard(Arc<ConcurrencyProbe>);

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub step_id: StepId,
    pub attempt: u32,
    pub payload: Value,
    pub upstream: Vec<StepId>,
    /// Runtime clock at invocation start; follows paused test time.
    pub started_at: Instant,
}

/// A scriptable capability handler.
///
/// By default it succeeds immediately with one record keyed by the step id
/// and the step's payload as `data`. Clones share call history and health,
/// so keep a clone to inspect a handler after registering it.
#[derive(Debug, Clone)]
pub struct MockHandler {
    delay: Duration,
    fail_times: usize,
    failure: HandlerError,
    records: Option<Vec<(String, Value, f64)>>,
    data: Option<Value>,
    progress: bool,
    honor_cancellation: bool,
    healthy: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    probe: Option<Arc<ConcurrencyProbe>>,
}

impl Default for MockHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHandler {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_times: 0,
            failure: HandlerError::unavailable("mock failure"),
            records: None,
            data: None,
            progress: false,
            honor_cancellation: true,
            healthy: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(Mutex::new(Vec::new())),
            probe: None,
        }
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `times` invocations, then succeed.
    pub fn failing_times(mut self, times: usize) -> Self {
        self.fail_times = times;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_times(usize::MAX)
    }

    /// Error returned by scripted failures.
    pub fn with_failure(mut self, error: HandlerError) -> Self {
        self.failure = error;
        self
    }

    /// Emit exactly these `(key, payload, score)` records on success.
    pub fn with_records<K: Into<String>>(mut self, records: Vec<(K, Value, f64)>) -> Self {
        self.records = Some(
            records
                .into_iter()
                .map(|(key, payload, score)| (key.into(), payload, score))
                .collect(),
        );
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Report progress at the start and midpoint of each invocation.
    pub fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    /// Keep sleeping after the invocation is cancelled.
    pub fn ignoring_cancellation(mut self) -> Self {
        self.honor_cancellation = false;
        self
    }

    pub fn with_probe(mut self, probe: Arc<ConcurrencyProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn was_called_for(&self, step: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|call| call.step_id.as_str() == step)
    }

    /// Start time of the first invocation for `step`.
    pub fn started_at(&self, step: &str) -> Option<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|call| call.step_id.as_str() == step)
            .map(|call| call.started_at)
    }

    pub fn into_handler(self) -> Arc<dyn CapabilityHandler> {
        Arc::new(self)
    }

    async fn pause(&self, ctx: &InvocationContext, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        if self.honor_cancellation {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => {}
                _ = tokio::time::sleep(duration) => {}
            }
        } else {
            tokio::time::sleep(duration).await;
        }
    }
}

#[async_trait]
impl CapabilityHandler for MockHandler {
    async fn invoke(
        &self,
        input: StepInput,
        ctx: InvocationContext,
    ) -> Result<StepOutput, HandlerError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(MockCall {
                step_id: ctx.step_id.clone(),
                attempt: ctx.attempt,
                payload: input.payload.clone(),
                upstream: input.upstream.keys().cloned().collect(),
                started_at: Instant::now(),
            });
            calls.len()
        };
        let _guard = self.probe.as_ref().map(|probe| probe.enter());

        if self.progress {
            ctx.report_progress("started", Some(0.0));
            self.pause(&ctx, self.delay / 2).await;
            ctx.report_progress("halfway", Some(0.5));
            self.pause(&ctx, self.delay - self.delay / 2).await;
        } else {
            self.pause(&ctx, self.delay).await;
        }

        if call_index <= self.fail_times {
            return Err(self.failure.clone());
        }

        let mut output = match &self.data {
            Some(data) => StepOutput::with_data(data.clone()),
            None => StepOutput::with_data(input.payload.clone()),
        };
        match &self.records {
            Some(records) => {
                for (key, payload, score) in records {
                    output = output.record(key.clone(), payload.clone(), *score);
                }
            }
            None => output = output.record(ctx.step_id.as_str(), input.payload, 1.0),
        }
        Ok(output)
    }

    async fn health_check(&self) -> HandlerHealth {
        if self.healthy.load(Ordering::SeqCst) {
            HandlerHealth::Healthy
        } else {
            HandlerHealth::unhealthy("mock marked unhealthy")
        }
    }
}
