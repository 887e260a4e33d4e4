//! # Lifecycle Manager
//!
//! Owns every [`StepInstance`] of one plan execution and drives it through
//!
//! ```text
//! queued -> initializing -> running -> completing -> completed
//!    |            |            |
//!    +------------+------------+-----> failed
//! any non-terminal state --------------> terminated
//! ```
//!
//! Handlers run as independent tasks under the step timeout and a
//! cancellation token. A panicking handler is reported as a failed attempt.
//! Every transition is broadcast to [`LifecycleManager::subscribe`]rs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use tessera_core::{
    CapabilityHandler, CapabilityName, ContextStore, HandlerError, HandlerId, InvocationContext,
    PlanId, ProgressReporter, StepError, StepId, StepInput, StepOutput, StepResult,
};

use crate::queue::AdmissionPermit;
use crate::registry::CapabilityDescriptor;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Queued,
    Initializing,
    Running,
    Completing,
    Completed,
    Failed,
    Terminated,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Whether the handler has been (or is being) invoked.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Running | Self::Completing)
    }

    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (from, Terminated) => !from.is_terminal(),
            (Queued, Initializing | Failed)
            | (Initializing, Running | Failed)
            | (Running, Completing | Failed)
            | (Completing, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique id of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInstance {
    pub id: InstanceId,
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub capability: CapabilityName,
    pub handler_id: HandlerId,
    pub attempt: u32,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<StepError>,
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub instance_id: InstanceId,
    pub step_id: StepId,
    pub capability: CapabilityName,
    pub attempt: u32,
    pub from: InstanceState,
    pub to: InstanceState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("step instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("step instance {instance} cannot move from {from} to {to}")]
    InvalidTransition {
        instance: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Observer invoked on instance milestones. Hooks run inline on the
/// instance task and must not block.
pub trait LifecycleHook: Send + Sync {
    fn on_running(&self, _instance: &StepInstance) {}

    /// Runs while the instance is `completing`, before it is `completed`.
    fn on_completed(&self, _instance: &StepInstance, _output: &StepOutput, _elapsed: Duration) {}

    fn on_failed(&self, _instance: &StepInstance, _error: &StepError, _elapsed: Duration) {}

    /// `from` is the state the instance left.
    fn on_terminated(&self, _instance: &StepInstance, _from: InstanceState) {}
}

struct InstanceEntry {
    instance: StepInstance,
    handler: Arc<dyn CapabilityHandler>,
    cancel: CancellationToken,
    terminate_reason: Option<String>,
}

/// Awaitable result of a spawned instance.
pub struct InstanceHandle {
    id: InstanceId,
    step_id: StepId,
    join: JoinHandle<StepResult<StepOutput>>,
}

impl InstanceHandle {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub async fn outcome(self) -> StepResult<StepOutput> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(StepError::Terminated {
                step: self.step_id,
                reason: format!("instance task aborted: {e}"),
            }),
        }
    }
}

/// Per-plan owner of step instances.
pub struct LifecycleManager {
    plan_id: PlanId,
    instances: DashMap<InstanceId, InstanceEntry>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    context_store: Option<Arc<dyn ContextStore>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleManager {
    pub fn new(plan_id: PlanId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            plan_id,
            instances: DashMap::new(),
            hooks: Vec::new(),
            context_store: None,
            events,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Register a new attempt in `queued`.
    pub fn create(
        &self,
        step_id: &StepId,
        attempt: u32,
        descriptor: &CapabilityDescriptor,
    ) -> InstanceId {
        let id = InstanceId::generate();
        let instance = StepInstance {
            id,
            plan_id: self.plan_id.clone(),
            step_id: step_id.clone(),
            capability: descriptor.name().clone(),
            handler_id: descriptor.handler_id().clone(),
            attempt,
            state: InstanceState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        };
        self.instances.insert(
            id,
            InstanceEntry {
                instance,
                handler: Arc::clone(descriptor.handler()),
                cancel: CancellationToken::new(),
                terminate_reason: None,
            },
        );
        id
    }

    /// Run the handler for an admitted instance on its own task. The permit
    /// is held until the task ends.
    pub fn spawn(
        self: &Arc<Self>,
        id: InstanceId,
        permit: AdmissionPermit,
        input: StepInput,
        timeout: Duration,
        progress: Option<Arc<dyn ProgressReporter>>,
    ) -> LifecycleResult<InstanceHandle> {
        let (instance, handler, cancel) = {
            let entry = self
                .instances
                .get(&id)
                .ok_or(LifecycleError::InstanceNotFound(id))?;
            if entry.instance.state != InstanceState::Queued {
                return Err(LifecycleError::InvalidTransition {
                    instance: id,
                    from: entry.instance.state,
                    to: InstanceState::Initializing,
                });
            }
            (
                entry.instance.clone(),
                Arc::clone(&entry.handler),
                entry.cancel.clone(),
            )
        };

        let mut ctx = InvocationContext::new(
            self.plan_id.clone(),
            instance.step_id.clone(),
            instance.capability.clone(),
            instance.handler_id.clone(),
            instance.attempt,
            timeout,
        )
        .with_cancellation(cancel.child_token());
        if let Some(store) = &self.context_store {
            ctx = ctx.with_context_store(Arc::clone(store));
        }
        if let Some(progress) = progress {
            ctx = ctx.with_progress(progress);
        }

        let manager = Arc::clone(self);
        let step_id = instance.step_id.clone();
        let join = tokio::spawn(async move {
            let _permit = permit;
            manager
                .drive(id, handler, input, ctx, timeout, cancel)
                .await
        });

        Ok(InstanceHandle { id, step_id, join })
    }

    async fn drive(
        &self,
        id: InstanceId,
        handler: Arc<dyn CapabilityHandler>,
        input: StepInput,
        ctx: InvocationContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> StepResult<StepOutput> {
        let started = Instant::now();
        let handler_cancel = ctx.cancellation().clone();
        let handler_id = ctx.handler_id.clone();

        if self.transition(id, InstanceState::Initializing, None).is_err() {
            return Err(self.terminated_error(id));
        }
        match self.transition(id, InstanceState::Running, None) {
            Ok(running) => self.hooks.iter().for_each(|h| h.on_running(&running)),
            Err(_) => return Err(self.terminated_error(id)),
        }

        let invocation = tokio::spawn(async move { handler.invoke(input, ctx).await });
        let abort = invocation.abort_handle();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                return Err(self.terminated_error(id));
            }
            outcome = tokio::time::timeout(timeout, invocation) => outcome,
        };

        let step = self.step_id(id);
        let result = match outcome {
            Err(_) => {
                handler_cancel.cancel();
                abort.abort();
                Err(StepError::StepTimeout {
                    step,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                warn!(step_id = %step, %handler_id, %message, "Handler panicked");
                Err(StepError::HandlerFailed {
                    step,
                    handler: handler_id,
                    source: HandlerError::failed(format!("handler panicked: {message}")),
                })
            }
            Ok(Err(_)) => return Err(self.terminated_error(id)),
            Ok(Ok(Err(source))) => Err(StepError::HandlerFailed {
                step,
                handler: handler_id,
                source,
            }),
            Ok(Ok(Ok(output))) => Ok(output),
        };

        match result {
            Ok(output) => self.complete(id, output, started.elapsed()),
            Err(error) => self.fail(id, error, started.elapsed()),
        }
    }

    fn complete(
        &self,
        id: InstanceId,
        output: StepOutput,
        elapsed: Duration,
    ) -> StepResult<StepOutput> {
        let completing = match self.transition(id, InstanceState::Completing, None) {
            Ok(instance) => instance,
            Err(_) => return Err(self.terminated_error(id)),
        };
        for hook in &self.hooks {
            hook.on_completed(&completing, &output, elapsed);
        }
        match self.transition(id, InstanceState::Completed, None) {
            Ok(_) => Ok(output),
            Err(_) => Err(self.terminated_error(id)),
        }
    }

    /// Mark an instance failed. Used for handler failures and for requests
    /// that never got admitted.
    pub fn fail(&self, id: InstanceId, error: StepError, elapsed: Duration) -> StepResult<StepOutput> {
        match self.transition(id, InstanceState::Failed, Some(error.clone())) {
            Ok(failed) => {
                for hook in &self.hooks {
                    hook.on_failed(&failed, &error, elapsed);
                }
                Err(error)
            }
            Err(_) => Err(self.terminated_error(id)),
        }
    }

    /// Move an instance to `terminated` and cancel its handler.
    pub fn terminate(&self, id: InstanceId, reason: &str) -> LifecycleResult<StepInstance> {
        let step = self.step_id(id);
        let error = StepError::Terminated {
            step,
            reason: reason.to_string(),
        };
        let (from, terminated) =
            self.transition_from(id, InstanceState::Terminated, Some(error))?;
        if let Some(mut entry) = self.instances.get_mut(&id) {
            entry.terminate_reason = Some(reason.to_string());
            entry.cancel.cancel();
        }
        debug!(
            instance = %id,
            step_id = %terminated.step_id,
            reason,
            "Terminated step instance"
        );
        for hook in &self.hooks {
            hook.on_terminated(&terminated, from);
        }
        Ok(terminated)
    }

    /// Terminate every non-terminal instance. Returns the terminated
    /// snapshots.
    pub fn terminate_all(&self, reason: &str) -> Vec<StepInstance> {
        let live: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|entry| !entry.instance.state.is_terminal())
            .map(|entry| *entry.key())
            .collect();
        live.into_iter()
            .filter_map(|id| self.terminate(id, reason).ok())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Instances of `capability` between admission and completion.
    pub fn running_count(&self, capability: &CapabilityName) -> usize {
        self.instances
            .iter()
            .filter(|entry| {
                &entry.instance.capability == capability && entry.instance.state.is_active()
            })
            .count()
    }

    pub fn get(&self, id: InstanceId) -> Option<StepInstance> {
        self.instances.get(&id).map(|entry| entry.instance.clone())
    }

    pub fn instances(&self) -> Vec<StepInstance> {
        self.instances
            .iter()
            .map(|entry| entry.instance.clone())
            .collect()
    }

    fn transition(
        &self,
        id: InstanceId,
        to: InstanceState,
        error: Option<StepError>,
    ) -> LifecycleResult<StepInstance> {
        self.transition_from(id, to, error).map(|(_, instance)| instance)
    }

    /// Apply a transition and return the state it left.
    fn transition_from(
        &self,
        id: InstanceId,
        to: InstanceState,
        error: Option<StepError>,
    ) -> LifecycleResult<(InstanceState, StepInstance)> {
        let snapshot = {
            let mut entry = self
                .instances
                .get_mut(&id)
                .ok_or(LifecycleError::InstanceNotFound(id))?;
            let from = entry.instance.state;
            if !from.can_transition_to(to) {
                return Err(LifecycleError::InvalidTransition {
                    instance: id,
                    from,
                    to,
                });
            }
            let now = Utc::now();
            let instance = &mut entry.instance;
            instance.state = to;
            if to == InstanceState::Running {
                instance.started_at = Some(now);
            }
            if to.is_terminal() {
                instance.finished_at = Some(now);
            }
            if error.is_some() {
                instance.error = error;
            }
            (from, instance.clone())
        };

        let (from, instance) = snapshot;
        // No subscribers is not an error.
        let _ = self.events.send(LifecycleEvent {
            instance_id: id,
            step_id: instance.step_id.clone(),
            capability: instance.capability.clone(),
            attempt: instance.attempt,
            from,
            to,
            at: instance.finished_at.unwrap_or_else(Utc::now),
        });
        Ok((from, instance))
    }

    fn step_id(&self, id: InstanceId) -> StepId {
        self.instances
            .get(&id)
            .map(|entry| entry.instance.step_id.clone())
            .unwrap_or_else(|| StepId::new_unchecked("unknown"))
    }

    fn terminated_error(&self, id: InstanceId) -> StepError {
        let (step, reason) = self
            .instances
            .get(&id)
            .map(|entry| {
                (
                    entry.instance.step_id.clone(),
                    entry
                        .terminate_reason
                        .clone()
                        .unwrap_or_else(|| "terminated".to_string()),
                )
            })
            .unwrap_or_else(|| (StepId::new_unchecked("unknown"), "terminated".to_string()));
        StepError::Terminated { step, reason }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AdmissionRequest, TaskQueue};
    use crate::registry::{Capability, CapabilityRegistry};
    use async_trait::async_trait;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Mutex;
    use tessera_core::StepPriority;

    enum Script {
        Succeed,
        Fail,
        Sleep(Duration),
        Panic,
    }

    struct Scripted(Script);

    #[async_trait]
    impl CapabilityHandler for Scripted {
        async fn invoke(
            &self,
            input: StepInput,
            _ctx: InvocationContext,
        ) -> Result<StepOutput, HandlerError> {
            match &self.0 {
                Script::Succeed => Ok(StepOutput::with_data(input.payload).record(
                    "k",
                    json!(1),
                    0.5,
                )),
                Script::Fail => Err(HandlerError::unavailable("backend down")),
                Script::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(StepOutput::empty())
                }
                Script::Panic => panic!("boom"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingHook(Mutex<Vec<String>>);

    impl LifecycleHook for RecordingHook {
        fn on_running(&self, instance: &StepInstance) {
            self.0.lock().unwrap().push(format!("running:{}", instance.step_id));
        }

        fn on_completed(&self, instance: &StepInstance, output: &StepOutput, _: Duration) {
            assert_eq!(instance.state, InstanceState::Completing);
            self.0
                .lock()
                .unwrap()
                .push(format!("completed:{}:{}", instance.step_id, output.records.len()));
        }

        fn on_failed(&self, instance: &StepInstance, error: &StepError, _: Duration) {
            self.0
                .lock()
                .unwrap()
                .push(format!("failed:{}:{}", instance.step_id, error.kind()));
        }

        fn on_terminated(&self, instance: &StepInstance, from: InstanceState) {
            self.0
                .lock()
                .unwrap()
                .push(format!("terminated:{}:{}", instance.step_id, from.as_str()));
        }
    }

    struct Fixture {
        queue: TaskQueue,
        descriptor: Arc<CapabilityDescriptor>,
        manager: Arc<LifecycleManager>,
        hook: Arc<RecordingHook>,
    }

    fn fixture(script: Script) -> Fixture {
        let registry = CapabilityRegistry::new();
        let descriptor = registry
            .register(Capability::new(
                CapabilityName::new_unchecked("search"),
                Arc::new(Scripted(script)),
            ))
            .unwrap();
        let hook = Arc::new(RecordingHook::default());
        let manager = Arc::new(LifecycleManager::new(PlanId::generate()).with_hook(hook.clone()));
        Fixture {
            queue: TaskQueue::new(Duration::from_secs(1)),
            descriptor,
            manager,
            hook,
        }
    }

    impl Fixture {
        async fn start(&self, step: &str, timeout: Duration) -> (InstanceId, InstanceHandle) {
            let step_id = StepId::new_unchecked(step);
            let id = self.manager.create(&step_id, 1, &self.descriptor);
            let permit = self
                .queue
                .enqueue(AdmissionRequest::new(
                    step_id,
                    Arc::clone(&self.descriptor),
                    StepPriority::Normal,
                ))
                .await
                .unwrap();
            let handle = self
                .manager
                .spawn(id, permit, StepInput::new(json!("in")), timeout, None)
                .unwrap();
            (id, handle)
        }
    }

    #[rstest]
    #[case(InstanceState::Queued, InstanceState::Initializing, true)]
    #[case(InstanceState::Queued, InstanceState::Running, false)]
    #[case(InstanceState::Initializing, InstanceState::Running, true)]
    #[case(InstanceState::Running, InstanceState::Completing, true)]
    #[case(InstanceState::Running, InstanceState::Completed, false)]
    #[case(InstanceState::Completing, InstanceState::Completed, true)]
    #[case(InstanceState::Running, InstanceState::Failed, true)]
    #[case(InstanceState::Queued, InstanceState::Terminated, true)]
    #[case(InstanceState::Completing, InstanceState::Terminated, true)]
    #[case(InstanceState::Completed, InstanceState::Terminated, false)]
    #[case(InstanceState::Failed, InstanceState::Running, false)]
    fn test_transition_table(
        #[case] from: InstanceState,
        #[case] to: InstanceState,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[tokio::test]
    async fn test_successful_instance_runs_hooks_and_completes() {
        let fx = fixture(Script::Succeed);
        let mut events = fx.manager.subscribe();

        let (id, handle) = fx.start("a", Duration::from_secs(1)).await;
        let output = handle.outcome().await.unwrap();

        assert_eq!(output.data, json!("in"));
        let instance = fx.manager.get(id).unwrap();
        assert_eq!(instance.state, InstanceState::Completed);
        assert!(instance.started_at.is_some());
        assert_eq!(
            *fx.hook.0.lock().unwrap(),
            ["running:a", "completed:a:1"]
        );

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.to);
        }
        assert_eq!(
            seen,
            [
                InstanceState::Initializing,
                InstanceState::Running,
                InstanceState::Completing,
                InstanceState::Completed
            ]
        );
        assert_eq!(fx.queue.running(fx.descriptor.key()), 0);
    }

    #[tokio::test]
    async fn test_handler_error_fails_instance() {
        let fx = fixture(Script::Fail);
        let (id, handle) = fx.start("a", Duration::from_secs(1)).await;

        let err = handle.outcome().await.unwrap_err();
        assert!(matches!(err, StepError::HandlerFailed { .. }));
        assert!(err.is_retryable());
        let instance = fx.manager.get(id).unwrap();
        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.error, Some(err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_instance() {
        let fx = fixture(Script::Sleep(Duration::from_secs(10)));
        let (id, handle) = fx.start("slow", Duration::from_millis(100)).await;

        let err = handle.outcome().await.unwrap_err();
        assert!(matches!(err, StepError::StepTimeout { timeout_ms: 100, .. }));
        assert_eq!(fx.manager.get(id).unwrap().state, InstanceState::Failed);
        assert_eq!(*fx.hook.0.lock().unwrap(), ["running:slow", "failed:slow:step_timeout"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let fx = fixture(Script::Panic);
        let (_, handle) = fx.start("p", Duration::from_secs(1)).await;

        match handle.outcome().await.unwrap_err() {
            StepError::HandlerFailed { source, .. } => {
                assert!(source.to_string().contains("handler panicked: boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_running_instance_releases_slot() {
        let fx = fixture(Script::Sleep(Duration::from_secs(60)));
        let (id, handle) = fx.start("long", Duration::from_secs(120)).await;

        while fx.manager.running_count(fx.descriptor.name()) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fx.queue.running(fx.descriptor.key()), 1);

        let terminated = fx.manager.terminate(id, "plan timeout").unwrap();
        assert_eq!(terminated.state, InstanceState::Terminated);

        let err = handle.outcome().await.unwrap_err();
        assert_eq!(
            err,
            StepError::Terminated {
                step: StepId::new_unchecked("long"),
                reason: "plan timeout".to_string()
            }
        );
        assert_eq!(fx.queue.running(fx.descriptor.key()), 0);
        assert_eq!(fx.manager.running_count(fx.descriptor.name()), 0);
        assert_eq!(
            *fx.hook.0.lock().unwrap(),
            ["running:long", "terminated:long:running"]
        );
    }

    #[tokio::test]
    async fn test_terminal_instance_rejects_termination() {
        let fx = fixture(Script::Succeed);
        let (id, handle) = fx.start("a", Duration::from_secs(1)).await;
        handle.outcome().await.unwrap();

        let err = fx.manager.terminate(id, "late").unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                instance: id,
                from: InstanceState::Completed,
                to: InstanceState::Terminated
            }
        );
    }

    #[tokio::test]
    async fn test_terminate_all_covers_queued_instances() {
        let fx = fixture(Script::Succeed);
        let a = fx
            .manager
            .create(&StepId::new_unchecked("a"), 1, &fx.descriptor);
        let b = fx
            .manager
            .create(&StepId::new_unchecked("b"), 1, &fx.descriptor);

        let terminated = fx.manager.terminate_all("cancelled");
        assert_eq!(terminated.len(), 2);
        assert_eq!(fx.manager.get(a).unwrap().state, InstanceState::Terminated);
        assert_eq!(fx.manager.get(b).unwrap().state, InstanceState::Terminated);
        assert!(fx.manager.terminate_all("again").is_empty());
    }
}
