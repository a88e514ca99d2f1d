//! Heartbeat-based worker supervision.
//!
//! Any message from a worker counts as a heartbeat. Every
//! `heartbeat_interval` the pool runs a tick that:
//!
//! 1. flags workers silent for longer than `stuck_threshold` as stuck, as
//!    well as suspect workers (a caller timed out on them) that have either
//!    not been heard from for a full interval since being flagged or still
//!    not answered the timed-out request `stuck_threshold` later;
//! 2. samples resident memory of every live worker through its
//!    [`SubprocessHandle`](crate::process::SubprocessHandle), falling back
//!    to the last self-reported value, and terminates workers over
//!    `memory_limit_mb`;
//! 3. tops the pool back up to `min_workers`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::ConcurrencyConfig;
use crate::core::events::{PoolEvent, WorkerStuck};
use crate::core::lifecycle::{TerminationReason, WorkerRegistry};
use crate::core::pool::PoolInner;
use crate::core::types::{RequestId, WorkerId, WorkerInfo, WorkerState};
use crate::util::clock::{duration_ms, now_ms};

/// A worker flagged by [`WorkerHealth::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckWorker {
    /// Flagged worker.
    pub worker_id: WorkerId,
    /// Time since its last heartbeat.
    pub silent_for: Duration,
    /// Request it was serving, if any.
    pub request_id: Option<RequestId>,
}

/// Stuck-detection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHealth {
    stuck_threshold: Duration,
    heartbeat_interval: Duration,
}

impl WorkerHealth {
    /// Policy with explicit thresholds.
    #[must_use]
    pub const fn new(stuck_threshold: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            stuck_threshold,
            heartbeat_interval,
        }
    }

    /// Policy taken from a pool configuration.
    #[must_use]
    pub const fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(config.stuck_threshold(), config.heartbeat_interval())
    }

    /// Whether a worker should be considered stuck at `now`.
    #[must_use]
    pub fn is_stuck(&self, info: &WorkerInfo, suspect_since: Option<Instant>, now: Instant) -> bool {
        match info.state {
            WorkerState::Stuck => return true,
            WorkerState::Idle | WorkerState::Busy => {}
            WorkerState::Starting | WorkerState::Terminating | WorkerState::Terminated => return false,
        }
        if now.saturating_duration_since(info.last_heartbeat_at) > self.stuck_threshold {
            return true;
        }
        // The suspect flag clears when the timed-out request is answered,
        // so a worker still flagged after `stuck_threshold` never replied,
        // even if its heartbeat task keeps running.
        suspect_since.is_some_and(|flagged| {
            let flagged_for = now.saturating_duration_since(flagged);
            (info.last_heartbeat_at <= flagged && flagged_for >= self.heartbeat_interval)
                || flagged_for >= self.stuck_threshold
        })
    }

    /// Flag every stuck worker in `registry` and return them.
    pub(crate) fn inspect(&self, registry: &mut WorkerRegistry, now: Instant) -> Vec<StuckWorker> {
        let stuck: Vec<StuckWorker> = registry
            .ids()
            .filter_map(|id| {
                let info = registry.get(id)?;
                if info.state == WorkerState::Stuck
                    || !self.is_stuck(info, registry.suspect_since(id), now)
                {
                    return None;
                }
                Some(StuckWorker {
                    worker_id: id,
                    silent_for: now.saturating_duration_since(info.last_heartbeat_at),
                    request_id: registry.in_flight(id).cloned(),
                })
            })
            .collect();
        for worker in &stuck {
            registry.mark_stuck(worker.worker_id);
        }
        stuck
    }
}

impl PoolInner {
    /// One supervision pass.
    pub(crate) async fn health_tick(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        let now = Instant::now();
        let (stuck, targets) = {
            let mut state = self.state.lock();
            let stuck = self.health.inspect(&mut state.registry, now);
            for worker in &stuck {
                self.sink.publish(PoolEvent::WorkerStuck(WorkerStuck {
                    worker_id: worker.worker_id,
                    silent_for_ms: duration_ms(worker.silent_for),
                    request_id: worker.request_id.clone(),
                    timestamp_ms: now_ms(),
                }));
            }
            (stuck, state.registry.sampling_targets())
        };

        for worker in stuck {
            self.terminate(worker.worker_id, TerminationReason::Stuck);
        }

        for (worker_id, handle, reported) in targets {
            let Some(memory_mb) = handle.memory_usage_mb().await.or(reported) else {
                continue;
            };
            self.state.lock().registry.record_memory(worker_id, memory_mb);
            if memory_mb > self.config.memory_limit_mb {
                warn!(
                    worker_id = %worker_id,
                    memory_mb,
                    limit_mb = self.config.memory_limit_mb,
                    "worker over memory limit"
                );
                self.terminate(worker_id, TerminationReason::OutOfMemory { memory_mb });
            }
        }

        if let Err(e) = self.ensure_min_workers().await {
            warn!(error = %e, "could not restore minimum worker count");
        }
    }
}

/// Run [`PoolInner::health_tick`] every `period` until the pool is dropped
/// or shut down.
pub(crate) async fn run_health_loop(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_shutting_down() {
            break;
        }
        inner.health_tick().await;
    }
    debug!("health loop stopped");
}
