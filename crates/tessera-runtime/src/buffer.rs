//! # Result Buffer
//!
//! Deduplicating store for the records steps produce. Records are keyed by
//! their `key`; when several sources report the same key their scores are
//! folded into one weighted mean:
//!
//! ```text
//! merged = Σ weight(source) * max_score(source) / Σ weight(source)
//! ```
//!
//! Each source contributes only its best score, so the fold is commutative,
//! associative and idempotent. The payload of the first insertion is kept.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tessera_core::{CapabilityName, StepError, StepId, StepOutput};

use crate::config::MergeWeights;
use crate::lifecycle::{LifecycleHook, StepInstance};

/// One deduplicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub key: String,
    pub payload: Value,
    pub sources: BTreeSet<CapabilityName>,
    pub score: f64,
}

/// A permanently failed step recorded as degradation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: StepId,
    pub capability: CapabilityName,
    pub required: bool,
    pub error: StepError,
}

struct Entry {
    payload: Value,
    scores: BTreeMap<CapabilityName, f64>,
    merged: f64,
    first_seq: u64,
}

/// Concurrent record store for one plan execution.
pub struct ResultBuffer {
    entries: DashMap<String, Entry>,
    weights: MergeWeights,
    next_seq: AtomicU64,
    failures: Mutex<Vec<StepFailure>>,
}

impl ResultBuffer {
    pub fn new(weights: MergeWeights) -> Self {
        Self {
            entries: DashMap::new(),
            weights,
            next_seq: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Fold one contribution into the record for `key`.
    pub fn add(
        &self,
        key: impl Into<String>,
        payload: Value,
        source: &CapabilityName,
        raw_score: f64,
    ) {
        let key = key.into();
        let score = if raw_score.is_finite() {
            raw_score
        } else {
            tracing::warn!(%key, %source, raw_score, "Non-finite record score treated as 0");
            0.0
        };

        let mut entry = self.entries.entry(key).or_insert_with(|| Entry {
            payload,
            scores: BTreeMap::new(),
            merged: score,
            first_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });

        let best = entry
            .scores
            .entry(source.clone())
            .or_insert(f64::NEG_INFINITY);
        if score <= *best {
            return;
        }
        *best = score;
        let merged = self.weighted_mean(&entry.scores);
        entry.merged = merged;
    }

    /// Fold every record of a step output under `source`.
    pub fn add_output(&self, source: &CapabilityName, output: &StepOutput) {
        for record in &output.records {
            self.add(record.key.clone(), record.payload.clone(), source, record.score);
        }
    }

    fn weighted_mean(&self, scores: &BTreeMap<CapabilityName, f64>) -> f64 {
        let (weighted, total) = scores
            .iter()
            .fold((0.0, 0.0), |(weighted, total), (source, score)| {
                let weight = self.weights.weight_for(source);
                (weighted + weight * score, total + weight)
            });
        if total > 0.0 { weighted / total } else { 0.0 }
    }

    /// Top `limit` records by score, ties by first insertion.
    pub fn snapshot(&self, limit: usize) -> Vec<ResultRecord> {
        let mut ranked: Vec<(u64, ResultRecord)> = self
            .entries
            .iter()
            .map(|entry| {
                (
                    entry.first_seq,
                    ResultRecord {
                        key: entry.key().clone(),
                        payload: entry.payload.clone(),
                        sources: entry.scores.keys().cloned().collect(),
                        score: entry.merged,
                    },
                )
            })
            .collect();
        ranked.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score.total_cmp(&a.score).then(seq_a.cmp(seq_b))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|(_, record)| record)
            .collect()
    }

    pub fn snapshot_all(&self) -> Vec<ResultRecord> {
        self.snapshot(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_failure(&self, failure: StepFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }

    pub fn failures(&self) -> Vec<StepFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True once any optional step has permanently failed.
    pub fn degraded(&self) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|f| !f.required)
    }
}

impl LifecycleHook for ResultBuffer {
    fn on_completed(&self, instance: &StepInstance, output: &StepOutput, _elapsed: Duration) {
        self.add_output(&instance.capability, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeWeight;
    use serde_json::json;

    fn name(s: &str) -> CapabilityName {
        CapabilityName::new_unchecked(s)
    }

    fn weights() -> MergeWeights {
        MergeWeights::new(MergeWeight::ONE)
            .with(name("search"), MergeWeight::new(3.0).unwrap())
            .with(name("recommend"), MergeWeight::new(1.0).unwrap())
    }

    #[test]
    fn test_new_key_takes_raw_score() {
        let buffer = ResultBuffer::new(weights());
        buffer.add("doc-1", json!({"title": "a"}), &name("search"), 0.8);

        let snapshot = buffer.snapshot_all();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].score, 0.8);
        assert_eq!(snapshot[0].payload, json!({"title": "a"}));
    }

    #[test]
    fn test_same_key_twice_is_one_record() {
        let buffer = ResultBuffer::new(weights());
        buffer.add("doc-1", json!(1), &name("search"), 0.6);
        buffer.add("doc-1", json!(1), &name("search"), 0.6);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.snapshot_all()[0].score, 0.6);
    }

    #[test]
    fn test_weighted_merge_across_sources() {
        let buffer = ResultBuffer::new(weights());
        buffer.add("doc-1", json!("first"), &name("search"), 0.8);
        buffer.add("doc-1", json!("second"), &name("recommend"), 0.4);

        let record = &buffer.snapshot_all()[0];
        assert!((record.score - 0.7).abs() < 1e-9);
        assert_eq!(record.payload, json!("first"));
        assert_eq!(
            record.sources.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            ["recommend", "search"]
        );
    }

    #[test]
    fn test_same_source_keeps_best_score() {
        let buffer = ResultBuffer::new(weights());
        buffer.add("doc-1", json!(1), &name("search"), 0.9);
        buffer.add("doc-1", json!(1), &name("search"), 0.2);
        assert_eq!(buffer.snapshot_all()[0].score, 0.9);
    }

    #[test]
    fn test_snapshot_orders_by_score_then_insertion() {
        let buffer = ResultBuffer::new(weights());
        buffer.add("b", json!(null), &name("search"), 0.5);
        buffer.add("a", json!(null), &name("search"), 0.9);
        buffer.add("c", json!(null), &name("search"), 0.5);

        let keys: Vec<_> = buffer.snapshot(2).into_iter().map(|r| r.key).collect();
        assert_eq!(keys, ["a", "b"]);
        let keys: Vec<_> = buffer.snapshot_all().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn test_non_finite_score_clamped() {
        let buffer = ResultBuffer::new(weights());
        buffer.add("x", json!(null), &name("search"), f64::NAN);
        assert_eq!(buffer.snapshot_all()[0].score, 0.0);
    }

    #[test]
    fn test_optional_failure_marks_degraded() {
        let buffer = ResultBuffer::new(weights());
        let failure = |required| StepFailure {
            step_id: StepId::new_unchecked("s"),
            capability: name("search"),
            required,
            error: StepError::Terminated {
                step: StepId::new_unchecked("s"),
                reason: "x".to_string(),
            },
        };

        buffer.record_failure(failure(true));
        assert!(!buffer.degraded());
        buffer.record_failure(failure(false));
        assert!(buffer.degraded());
        assert_eq!(buffer.failures().len(), 2);
    }
}
