//! # Plan Graph Builder
//!
//! Validates a [`Plan`] against the registry and levels its steps into
//! phases. A step's level is one more than the highest level among its
//! dependencies; steps without dependencies sit at level 0. Phases run in
//! ascending level order.
//!
//! A step marked `parallel = false` with no explicit dependency is chained
//! after the nearest preceding step of its parallel group (or simply the
//! preceding step when it has no group), so it lands in a later phase.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tessera_core::{Plan, PlanError, PlanResult, Step, StepId};

use crate::registry::CapabilityRegistry;

/// Steps that may run concurrently once every earlier phase is done.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub level: usize,
    /// In plan declaration order. `depends_on` includes implicit edges.
    pub steps: Vec<Step>,
}

impl Phase {
    pub fn step_ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }
}

/// A validated, leveled plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanGraph {
    phases: Vec<Phase>,
    step_count: usize,
    estimated_duration: Duration,
}

impl PlanGraph {
    /// Validate and level `plan`.
    ///
    /// Checks run in this order: duplicate ids, unknown dependencies,
    /// unregistered capabilities, per-step policies, cycles.
    pub fn build(
        plan: &Plan,
        registry: &CapabilityRegistry,
        default_step_timeout: Duration,
    ) -> PlanResult<Self> {
        let mut seen = HashSet::with_capacity(plan.steps.len());
        for step in &plan.steps {
            if !seen.insert(&step.id) {
                return Err(PlanError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
        }

        for step in &plan.steps {
            if let Some(missing) = step.depends_on.iter().find(|dep| !seen.contains(dep)) {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        for step in &plan.steps {
            if !registry.contains(&step.capability) {
                return Err(PlanError::CapabilityNotFound {
                    step: step.id.clone(),
                    capability: step.capability.clone(),
                });
            }
            step.validate()?;
        }

        let steps = with_implicit_dependencies(&plan.steps);
        let levels = assign_levels(&steps)?;

        let depth = levels.iter().max().map_or(0, |max| max + 1);
        let mut phases: Vec<Phase> = (0..depth)
            .map(|level| Phase {
                level,
                steps: Vec::new(),
            })
            .collect();
        for (step, level) in steps.into_iter().zip(levels) {
            phases[level].steps.push(step);
        }

        let estimated_duration = phases
            .iter()
            .map(|phase| {
                phase
                    .steps
                    .iter()
                    .map(|s| s.effective_timeout(default_step_timeout))
                    .max()
                    .unwrap_or_default()
            })
            .sum();

        Ok(Self {
            phases,
            step_count: plan.steps.len(),
            estimated_duration,
        })
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn into_phases(self) -> Vec<Phase> {
        self.phases
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Sum of each phase's longest step timeout.
    pub fn estimated_duration(&self) -> Duration {
        self.estimated_duration
    }

    /// Level of `step`, if it is part of the graph.
    pub fn level_of(&self, step: &StepId) -> Option<usize> {
        self.phases
            .iter()
            .find(|phase| phase.steps.iter().any(|s| &s.id == step))
            .map(|phase| phase.level)
    }
}

fn with_implicit_dependencies(steps: &[Step]) -> Vec<Step> {
    let mut resolved = steps.to_vec();
    for index in 0..steps.len() {
        let step = &steps[index];
        if step.parallel || !step.depends_on.is_empty() {
            continue;
        }
        let previous = steps[..index].iter().rev().find(|candidate| {
            step.parallel_group.is_none() || candidate.parallel_group == step.parallel_group
        });
        if let Some(previous) = previous {
            resolved[index].depends_on.insert(previous.id.clone());
        }
    }
    resolved
}

/// Longest-path leveling by repeated relaxation. Anything unresolved after
/// `n` passes sits on or behind a cycle.
fn assign_levels(steps: &[Step]) -> PlanResult<Vec<usize>> {
    let index: HashMap<&StepId, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| (&step.id, i))
        .collect();
    let mut levels: Vec<Option<usize>> = vec![None; steps.len()];

    for _ in 0..=steps.len() {
        let mut progressed = false;
        for (i, step) in steps.iter().enumerate() {
            if levels[i].is_some() {
                continue;
            }
            let level = step.depends_on.iter().try_fold(0, |acc, dep| {
                levels[index[dep]].map(|dep_level| acc.max(dep_level + 1))
            });
            if let Some(level) = level {
                levels[i] = Some(level);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    let unresolved: Vec<StepId> = steps
        .iter()
        .zip(&levels)
        .filter(|(_, level)| level.is_none())
        .map(|(step, _)| step.id.clone())
        .collect();
    if !unresolved.is_empty() {
        return Err(PlanError::DependencyCycle { steps: unresolved });
    }

    Ok(levels.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Capability;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tessera_core::{
        CapabilityHandler, CapabilityName, HandlerError, InvocationContext, RetryPolicy,
        StepInput, StepOutput,
    };

    struct Noop;

    #[async_trait]
    impl CapabilityHandler for Noop {
        async fn invoke(
            &self,
            _input: StepInput,
            _ctx: InvocationContext,
        ) -> Result<StepOutput, HandlerError> {
            Ok(StepOutput::empty())
        }
    }

    fn registry() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        for name in ["search", "summarize", "rank"] {
            registry
                .register(Capability::new(
                    CapabilityName::new_unchecked(name),
                    Arc::new(Noop),
                ))
                .unwrap();
        }
        registry
    }

    fn ids(phase: &Phase) -> Vec<String> {
        phase.steps.iter().map(|s| s.id.to_string()).collect()
    }

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_fan_in_levels() {
        let plan = Plan::builder()
            .step(Step::builder("a", "search").timeout(Duration::from_millis(100)))
            .step(Step::builder("b", "search").timeout(Duration::from_millis(150)))
            .step(
                Step::builder("c", "summarize")
                    .depends_on(["a", "b"])
                    .timeout(Duration::from_millis(50)),
            )
            .build()
            .unwrap();

        let graph = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(graph.phase_count(), 2);
        assert_eq!(ids(&graph.phases()[0]), ["a", "b"]);
        assert_eq!(ids(&graph.phases()[1]), ["c"]);
        assert_eq!(graph.estimated_duration(), Duration::from_millis(200));
        assert_eq!(graph.level_of(&StepId::new_unchecked("c")), Some(1));
    }

    #[test]
    fn test_level_is_longest_path() {
        let plan = Plan::builder()
            .step(Step::builder("a", "search"))
            .step(Step::builder("b", "rank").depends_on(["a"]))
            .step(Step::builder("c", "summarize").depends_on(["a", "b"]))
            .build()
            .unwrap();

        let graph = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap();
        let levels: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| graph.level_of(&StepId::new_unchecked(*id)).unwrap())
            .collect();
        assert_eq!(levels, [0, 1, 2]);
    }

    #[test]
    fn test_cycle_reports_unresolved_steps() {
        let plan = Plan::builder()
            .step(Step::builder("root", "search"))
            .step(Step::builder("x", "rank").depends_on(["y"]))
            .step(Step::builder("y", "rank").depends_on(["x"]))
            .step(Step::builder("tail", "summarize").depends_on(["y"]))
            .build()
            .unwrap();

        let err = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap_err();
        assert_eq!(
            err,
            PlanError::DependencyCycle {
                steps: vec![
                    StepId::new_unchecked("x"),
                    StepId::new_unchecked("y"),
                    StepId::new_unchecked("tail"),
                ]
            }
        );
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let plan = Plan::builder()
            .step(Step::builder("a", "search").depends_on(["ghost"]))
            .build()
            .unwrap();

        let err = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn test_unregistered_capability_rejected() {
        let plan = Plan::builder()
            .step(Step::builder("a", "translate"))
            .build()
            .unwrap();

        let err = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap_err();
        assert_eq!(
            err,
            PlanError::CapabilityNotFound {
                step: StepId::new_unchecked("a"),
                capability: CapabilityName::new_unchecked("translate"),
            }
        );
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut plan = Plan::builder()
            .step(Step::builder("a", "search"))
            .build()
            .unwrap();
        plan.steps.push(plan.steps[0].clone());

        let err = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStep { .. }));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let mut plan = Plan::builder()
            .step(Step::builder("a", "search"))
            .build()
            .unwrap();
        plan.steps[0].retry_policy = RetryPolicy::new(1, Duration::from_millis(10), 0.5);

        let err = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, PlanError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_sequential_step_chains_within_group() {
        let plan = Plan::builder()
            .step(Step::builder("fetch-a", "search").parallel_group("fetch"))
            .step(Step::builder("rank-a", "rank").parallel_group("rank"))
            .step(
                Step::builder("fetch-b", "search")
                    .parallel_group("fetch")
                    .sequential(),
            )
            .step(Step::builder("solo", "summarize").sequential())
            .build()
            .unwrap();

        let graph = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(ids(&graph.phases()[0]), ["fetch-a", "rank-a"]);
        assert_eq!(ids(&graph.phases()[1]), ["fetch-b"]);
        assert_eq!(ids(&graph.phases()[2]), ["solo"]);

        let fetch_b = &graph.phases()[1].steps[0];
        assert!(fetch_b.depends_on.contains("fetch-a"));
    }

    #[test]
    fn test_empty_plan_has_no_phases() {
        let plan = Plan::builder().build().unwrap();
        let graph = PlanGraph::build(&plan, &registry(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(graph.phase_count(), 0);
        assert_eq!(graph.estimated_duration(), Duration::ZERO);
    }
}
