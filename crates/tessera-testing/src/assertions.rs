//! Structural checks over a plan's event stream.

use std::collections::{HashMap, HashSet};

use tessera_core::StepId;
use tessera_runtime::{EventKind, StreamEvent};

/// Panic unless `events` form a well-ordered plan stream:
///
/// - `metadata` first and exactly one terminal event, last
/// - phases start in increasing order and each completes before the next starts
/// - every step event carries the phase that is currently open
/// - a step starts before any other event for it and ends at most once
pub fn assert_well_ordered(events: &[StreamEvent]) {
    assert!(!events.is_empty(), "empty event stream");
    assert_eq!(events[0].name(), "metadata", "first event must be metadata");
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected exactly one terminal event");
    assert!(
        events[events.len() - 1].is_terminal(),
        "terminal event must be last"
    );

    let mut open_phase: Option<usize> = None;
    let mut last_phase: Option<usize> = None;
    let mut started: HashSet<&StepId> = HashSet::new();
    let mut finished: HashSet<&StepId> = HashSet::new();

    for (index, event) in events.iter().enumerate() {
        match &event.kind {
            EventKind::PhaseStart { phase, .. } => {
                assert!(
                    open_phase.is_none(),
                    "phase {phase} started inside another phase (event {index})"
                );
                if let Some(last) = last_phase {
                    assert!(*phase > last, "phase {phase} started after phase {last}");
                }
                open_phase = Some(*phase);
                last_phase = Some(*phase);
            }
            EventKind::PhaseComplete { phase, .. } => {
                assert_eq!(open_phase, Some(*phase), "phase_complete for a phase that is not open");
                open_phase = None;
            }
            EventKind::StepStart { phase, step_id, .. } => {
                assert_eq!(open_phase, Some(*phase), "step {step_id} started outside its phase");
                assert!(started.insert(step_id), "step {step_id} started twice");
            }
            EventKind::StepProgress { phase, step_id, .. } => {
                assert_eq!(open_phase, Some(*phase), "progress for {step_id} outside its phase");
                assert!(started.contains(step_id), "progress for {step_id} before step_start");
                assert!(!finished.contains(step_id), "progress for {step_id} after it finished");
            }
            EventKind::StepComplete { phase, step_id, .. }
            | EventKind::StepError { phase, step_id, .. } => {
                assert_eq!(open_phase, Some(*phase), "{step_id} finished outside its phase");
                assert!(started.contains(step_id), "{step_id} finished before step_start");
                assert!(finished.insert(step_id), "{step_id} finished twice");
            }
            EventKind::Metadata { .. } | EventKind::Complete { .. } | EventKind::Error { .. } => {}
        }
    }
}

/// Number of events per wire name.
pub fn count_by_name(events: &[StreamEvent]) -> HashMap<&'static str, usize> {
    events.iter().fold(HashMap::new(), |mut counts, e| {
        *counts.entry(e.name()).or_insert(0) += 1;
        counts
    })
}

/// Steps listed in each `phase_start`, in order.
pub fn phase_layout(events: &[StreamEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::PhaseStart { steps, .. } => {
                Some(steps.iter().map(|s| s.as_str().to_string()).collect())
            }
            _ => None,
        })
        .collect()
}
