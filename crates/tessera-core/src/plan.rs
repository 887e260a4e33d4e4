//! # Plan Model
//!
//! A [`Plan`] is an ordered list of [`Step`]s plus a global timeout and a
//! fallback policy. Plans are immutable once submitted; the runtime derives
//! phases from them and never mutates the declaration.
//!
//! Plans deserialize from JSON with durations expressed in milliseconds:
//!
//! ```rust
//! use tessera_core::plan::Plan;
//!
//! let plan: Plan = serde_json::from_str(r#"{
//!     "steps": [
//!         {"id": "a", "capability": "search", "timeout_ms": 500},
//!         {"id": "b", "capability": "recommend"},
//!         {"id": "c", "capability": "merge", "depends_on": ["a", "b"], "required": false}
//!     ],
//!     "timeout_ms": 2000
//! }"#).unwrap();
//!
//! assert_eq!(plan.steps.len(), 3);
//! assert!(!plan.steps[2].required);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{PlanError, PlanResult};
use crate::identifiers::{CapabilityName, PlanId, StepId};

/// Admission priority. Higher levels are drained first by the task queue.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StepPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl StepPriority {
    /// All levels, highest first.
    pub const DESCENDING: [StepPriority; 4] = [
        StepPriority::Critical,
        StepPriority::High,
        StepPriority::Normal,
        StepPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Exponential backoff retry policy for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first one fails.
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    /// Growth factor applied per retry; must be finite and at least 1.0.
    pub multiplier: f64,
    /// Upper bound on any single backoff delay.
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn new(max_retries: u32, initial_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            multiplier,
            ..Self::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Delay before retry number `retry` (1-based):
    /// `initial_backoff * multiplier^(retry - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_backoff.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Total attempts the policy allows on one handler.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "backoff multiplier must be finite and >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err("max_backoff must not be smaller than initial_backoff".to_string());
        }
        Ok(())
    }
}

/// What to do when a step exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Mark the step permanently failed.
    None,
    /// Retry once on the next handler registered for the same capability.
    #[default]
    AlternateHandler,
}

/// One declared unit of work bound to a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub capability: CapabilityName,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: BTreeSet<StepId>,
    /// `false` orders this step after its peer when it declares no
    /// dependencies of its own.
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Handler deadline; the orchestrator default applies when absent.
    #[serde(default, rename = "timeout_ms", with = "millis::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub priority: StepPriority,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// A failed required step aborts the plan; an optional one degrades it.
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn builder(id: impl Into<String>, capability: impl Into<String>) -> StepBuilder {
        StepBuilder::new(id, capability)
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Check the step's policies. Identifier validity is guaranteed by the
    /// newtypes.
    pub fn validate(&self) -> PlanResult<()> {
        if let Some(timeout) = self.timeout
            && timeout.is_zero()
        {
            return Err(PlanError::InvalidPolicy {
                step: self.id.clone(),
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        self.retry_policy
            .validate()
            .map_err(|reason| PlanError::InvalidPolicy {
                step: self.id.clone(),
                reason,
            })
    }
}

/// A caller-submitted set of steps for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: PlanId,
    pub steps: Vec<Step>,
    /// Global deadline; the orchestrator default applies when absent.
    #[serde(default, rename = "timeout_ms", with = "millis::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

impl Plan {
    pub fn builder() -> PlanBuilder {
        PlanBuilder::default()
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Fluent construction of a [`Step`]; identifiers are validated on `build`.
#[derive(Debug, Clone)]
pub struct StepBuilder {
    id: String,
    capability: String,
    input: Value,
    depends_on: Vec<String>,
    parallel: bool,
    parallel_group: Option<String>,
    timeout: Option<Duration>,
    priority: StepPriority,
    retry_policy: RetryPolicy,
    required: bool,
}

impl StepBuilder {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            input: Value::Null,
            depends_on: Vec::new(),
            parallel: true,
            parallel_group: None,
            timeout: None,
            priority: StepPriority::default(),
            retry_policy: RetryPolicy::default(),
            required: true,
        }
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: StepPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn build(self) -> PlanResult<Step> {
        let id =
            StepId::parse(&self.id).map_err(|e| PlanError::invalid_identifier(&self.id, e))?;
        let capability = CapabilityName::parse(&self.capability)
            .map_err(|e| PlanError::invalid_identifier(&self.capability, e))?;
        let depends_on = self
            .depends_on
            .iter()
            .map(|dep| StepId::parse(dep).map_err(|e| PlanError::invalid_identifier(dep, e)))
            .collect::<PlanResult<BTreeSet<_>>>()?;

        let step = Step {
            id,
            capability,
            input: self.input,
            depends_on,
            parallel: self.parallel,
            parallel_group: self.parallel_group,
            timeout: self.timeout,
            priority: self.priority,
            retry_policy: self.retry_policy,
            required: self.required,
        };
        step.validate()?;
        Ok(step)
    }
}

/// Fluent construction of a [`Plan`].
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    id: Option<PlanId>,
    steps: Vec<StepBuilder>,
    timeout: Option<Duration>,
    fallback: FallbackPolicy,
}

impl PlanBuilder {
    pub fn id(mut self, id: PlanId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn build(self) -> PlanResult<Plan> {
        let steps = self
            .steps
            .into_iter()
            .map(StepBuilder::build)
            .collect::<PlanResult<Vec<_>>>()?;
        Ok(Plan {
            id: self.id.unwrap_or_default(),
            steps,
            timeout: self.timeout,
            fallback: self.fallback,
        })
    }
}

/// Serde helpers encoding `Duration` as integer milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
