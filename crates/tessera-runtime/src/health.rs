//! Periodic handler health probes.
//!
//! Each descriptor's `health_check` runs under the probe timeout; a probe
//! that errors out or overruns marks the descriptor unhealthy. Unhealthy
//! descriptors are skipped by admission until a later probe succeeds, at
//! which point waiting steps are re-examined.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tessera_core::HandlerHealth;

use crate::queue::TaskQueue;
use crate::registry::{CapabilityDescriptor, CapabilityRegistry};

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub unhealthy: usize,
    pub recovered: usize,
}

pub struct HealthMonitor {
    registry: Arc<CapabilityRegistry>,
    queue: TaskQueue,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        queue: TaskQueue,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            interval,
            probe_timeout,
        }
    }

    /// Probe every registered descriptor once, concurrently.
    pub async fn probe_all(&self) -> ProbeReport {
        let descriptors = self.registry.descriptors();
        let results = join_all(descriptors.iter().map(|d| self.probe(d))).await;

        let mut report = ProbeReport {
            probed: descriptors.len(),
            ..ProbeReport::default()
        };
        for (descriptor, healthy) in descriptors.iter().zip(results) {
            let was_healthy = descriptor.set_healthy(healthy);
            match (was_healthy, healthy) {
                (true, false) => {
                    warn!(descriptor = %descriptor.key(), "Capability handler became unhealthy");
                }
                (false, true) => {
                    info!(descriptor = %descriptor.key(), "Capability handler recovered");
                    report.recovered += 1;
                }
                _ => {}
            }
            if !healthy {
                report.unhealthy += 1;
            }
        }

        if report.recovered > 0 {
            self.queue.try_admit();
        }
        debug!(
            probed = report.probed,
            unhealthy = report.unhealthy,
            recovered = report.recovered,
            "Health probe round finished"
        );
        report
    }

    async fn probe(&self, descriptor: &CapabilityDescriptor) -> bool {
        match tokio::time::timeout(self.probe_timeout, descriptor.handler().health_check()).await {
            Ok(HandlerHealth::Healthy) => true,
            Ok(HandlerHealth::Unhealthy { reason }) => {
                debug!(descriptor = %descriptor.key(), %reason, "Health probe reported unhealthy");
                false
            }
            Err(_) => {
                debug!(
                    descriptor = %descriptor.key(),
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Health probe timed out"
                );
                false
            }
        }
    }

    /// Run probe rounds every `interval` until the handle is stopped.
    pub fn start(self) -> HealthMonitorHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_all().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        });
        HealthMonitorHandle { handle, shutdown }
    }
}

/// Handle to the background probe loop.
pub struct HealthMonitorHandle {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl HealthMonitorHandle {
    /// Stop the loop and wait for the current round to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
