//! # Task Queue
//!
//! Priority admission control with per-descriptor concurrency ceilings.
//!
//! Requests wait in one FIFO per priority level. Whenever a request arrives
//! or a permit is dropped, [`TaskQueue::try_admit`] scans levels from
//! `critical` down to `low` and admits the first request in each level whose
//! descriptor is healthy and below its `max_concurrency`, repeating until
//! nothing more fits. Nothing is ever dropped: callers behind a full
//! capability simply wait, up to their admission timeout.
//!
//! All running counts are mutated under one lock. Permits are handed to
//! waiters only after the lock is released, so a permit dropped by a waiter
//! that gave up can re-enter the queue safely.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

mod error;
mod metrics;
mod request;

pub use error::{QueueError, QueueResult};
pub use metrics::QueueMetrics;
pub use request::{AdmissionPermit, AdmissionRequest};

use metrics::CapabilityStats;
use tessera_core::{CapabilityName, StepPriority};

use crate::registry::DescriptorKey;

struct Ticket {
    id: u64,
    request: AdmissionRequest,
    enqueued_at: Instant,
    tx: oneshot::Sender<AdmissionPermit>,
}

#[derive(Default)]
struct QueueState {
    levels: BTreeMap<StepPriority, VecDeque<Ticket>>,
    running: HashMap<DescriptorKey, usize>,
    stats: HashMap<CapabilityName, CapabilityStats>,
    next_ticket: u64,
    closed: bool,
}

impl QueueState {
    /// Remove the first admissible ticket, highest priority first.
    fn pop_admissible(&mut self) -> Option<Ticket> {
        let running = &self.running;
        for priority in StepPriority::DESCENDING {
            let Some(level) = self.levels.get_mut(&priority) else {
                continue;
            };
            let position = level.iter().position(|ticket| {
                let descriptor = &ticket.request.descriptor;
                descriptor.is_healthy()
                    && running.get(descriptor.key()).copied().unwrap_or(0)
                        < descriptor.max_concurrency()
            });
            if let Some(index) = position {
                return level.remove(index);
            }
        }
        None
    }

    fn remove_ticket(&mut self, id: u64) -> Option<Ticket> {
        self.levels.values_mut().find_map(|level| {
            let index = level.iter().position(|ticket| ticket.id == id)?;
            level.remove(index)
        })
    }

    fn queued(&self) -> impl Iterator<Item = &Ticket> {
        self.levels.values().flatten()
    }

    fn stats_mut(&mut self, capability: &CapabilityName) -> &mut CapabilityStats {
        self.stats.entry(capability.clone()).or_default()
    }
}

pub(crate) struct QueueInner {
    state: Mutex<QueueState>,
    admission_timeout: Duration,
}

impl QueueInner {
    // Critical sections never panic, so a poisoned lock still guards
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_admit(self: &Arc<Self>) {
        let admitted = {
            let mut state = self.lock();
            let mut admitted = Vec::new();
            while let Some(ticket) = state.pop_admissible() {
                *state
                    .running
                    .entry(ticket.request.descriptor.key().clone())
                    .or_insert(0) += 1;
                admitted.push(ticket);
            }
            admitted
        };

        for ticket in admitted {
            let waited = ticket.enqueued_at.elapsed();
            let capability = ticket.request.descriptor.name().clone();
            trace!(
                step_id = %ticket.request.step_id,
                descriptor = %ticket.request.descriptor.key(),
                priority = ticket.request.priority.as_str(),
                waited_ms = waited.as_millis() as u64,
                "Admitted step"
            );
            let permit = AdmissionPermit {
                queue: Arc::clone(self),
                key: ticket.request.descriptor.key().clone(),
                waited,
            };
            match ticket.tx.send(permit) {
                Ok(()) => self.lock().stats_mut(&capability).record_admission(waited),
                Err(permit) => {
                    // The waiter is gone; count it before the permit's drop
                    // re-enters admission.
                    self.lock().stats_mut(&capability).total_cancelled += 1;
                    drop(permit);
                }
            }
        }
    }

    fn release(self: &Arc<Self>, key: &DescriptorKey) {
        {
            let mut state = self.lock();
            if let Some(count) = state.running.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
        self.try_admit();
    }
}

/// Removes the ticket if the waiting future is dropped before resolution.
struct WaitGuard<'a> {
    inner: &'a Arc<QueueInner>,
    ticket: u64,
    capability: CapabilityName,
    armed: bool,
}

impl WaitGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.lock();
        if state.remove_ticket(self.ticket).is_some() {
            state.stats_mut(&self.capability).total_cancelled += 1;
        }
    }
}

/// Priority admission controller shared by every plan execution.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(admission_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                admission_timeout,
            }),
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        self.inner.admission_timeout
    }

    /// Wait for a slot on the request's descriptor.
    ///
    /// Fails with [`QueueError::AdmissionTimeout`] once the request has
    /// waited longer than its timeout; the request is then gone from the
    /// queue. Dropping the returned future also withdraws the request.
    pub async fn enqueue(&self, request: AdmissionRequest) -> QueueResult<AdmissionPermit> {
        let timeout = request.timeout.unwrap_or(self.inner.admission_timeout);
        let capability = request.descriptor.name().clone();
        let handler = request.descriptor.handler_id().clone();
        let enqueued_at = Instant::now();
        let (tx, mut rx) = oneshot::channel();

        let ticket = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let id = state.next_ticket;
            state.next_ticket += 1;
            state
                .levels
                .entry(request.priority)
                .or_default()
                .push_back(Ticket {
                    id,
                    request,
                    enqueued_at,
                    tx,
                });
            id
        };

        let mut guard = WaitGuard {
            inner: &self.inner,
            ticket,
            capability: capability.clone(),
            armed: true,
        };
        self.inner.try_admit();

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(permit)) => {
                guard.disarm();
                Ok(permit)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(QueueError::Closed)
            }
            Err(_) => {
                guard.disarm();
                let removed = {
                    let mut state = self.inner.lock();
                    let removed = state.remove_ticket(ticket).is_some();
                    if removed {
                        state.stats_mut(&capability).total_timeouts += 1;
                    }
                    removed
                };
                // Lost the race: admitted between the deadline and removal.
                if !removed && let Ok(permit) = rx.try_recv() {
                    return Ok(permit);
                }
                let waited_ms = enqueued_at.elapsed().as_millis() as u64;
                debug!(%capability, %handler, waited_ms, "Admission timed out");
                Err(QueueError::AdmissionTimeout {
                    capability,
                    handler,
                    waited_ms,
                })
            }
        }
    }

    /// Admit every waiter that fits. Called automatically on enqueue and
    /// permit release; call it after a descriptor recovers its health.
    pub fn try_admit(&self) {
        self.inner.try_admit();
    }

    /// Running count of one descriptor.
    pub fn running(&self, key: &DescriptorKey) -> usize {
        self.inner.lock().running.get(key).copied().unwrap_or(0)
    }

    /// Running count summed over every descriptor of a capability.
    pub fn running_for(&self, capability: &CapabilityName) -> usize {
        self.inner
            .lock()
            .running
            .iter()
            .filter(|(key, _)| &key.capability == capability)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queued().count()
    }

    pub fn metrics_for(&self, capability: &CapabilityName) -> QueueMetrics {
        let state = self.inner.lock();
        let queued = state
            .queued()
            .filter(|ticket| ticket.request.descriptor.name() == capability)
            .count();
        let running = state
            .running
            .iter()
            .filter(|(key, _)| &key.capability == capability)
            .map(|(_, count)| *count)
            .sum();
        let stats = state.stats.get(capability);

        QueueMetrics {
            queued,
            running,
            total_admitted: stats.map_or(0, |s| s.total_admitted),
            total_timeouts: stats.map_or(0, |s| s.total_timeouts),
            total_cancelled: stats.map_or(0, |s| s.total_cancelled),
            avg_wait_ms: stats.map_or(0.0, CapabilityStats::avg_wait_ms),
        }
    }

    pub fn global_metrics(&self) -> QueueMetrics {
        let state = self.inner.lock();
        let total_admitted: u64 = state.stats.values().map(|s| s.total_admitted).sum();
        let total_wait: Duration = state.stats.values().map(|s| s.total_wait).sum();

        QueueMetrics {
            queued: state.queued().count(),
            running: state.running.values().sum(),
            total_admitted,
            total_timeouts: state.stats.values().map(|s| s.total_timeouts).sum(),
            total_cancelled: state.stats.values().map(|s| s.total_cancelled).sum(),
            avg_wait_ms: if total_admitted == 0 {
                0.0
            } else {
                total_wait.as_secs_f64() * 1000.0 / total_admitted as f64
            },
        }
    }

    /// Reject new requests and fail every waiter with [`QueueError::Closed`].
    /// Outstanding permits stay valid.
    pub fn close(&self) {
        let drained: Vec<Ticket> = {
            let mut state = self.inner.lock();
            state.closed = true;
            std::mem::take(&mut state.levels)
                .into_values()
                .flatten()
                .collect()
        };
        debug!(waiters = drained.len(), "Task queue closed");
    }
}
