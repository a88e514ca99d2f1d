//! Worker lifecycle: spawning, bookkeeping, recycling and termination.
//!
//! The [`WorkerRegistry`] is plain state mutated under the pool lock. The
//! async operations (`spawn_one`, `ensure_min_workers`, `recycle`,
//! `terminate`) live on [`PoolInner`] because they need the factory, the
//! event sink and the scheduler alongside the registry.
//!
//! Per-worker states: `Starting → Idle ⇄ Busy`, `Busy → Stuck →
//! Terminating`, and `Idle|Busy → Terminating` on recycle or memory
//! overrun. Removed slots are gone; [`WorkerState::Terminated`] only shows
//! up in snapshots taken by shutdown.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::error::{ConcurrencyError, PoolResult};
use crate::core::events::{PoolEvent, WorkerRecycled, WorkerSpawned};
use crate::core::pool::{PoolInner, PoolState};
use crate::core::types::{RequestId, WorkerId, WorkerInfo, WorkerOutcome, WorkerResponse, WorkerState};
use crate::process::{
    ParentMessage, SpawnedProcess, SubprocessConfig, SubprocessEvent, SubprocessHandle, WorkerMessage,
};
use crate::util::clock::{duration_ms, now_ms};

/// Why a worker left the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Served `max_requests_per_worker` requests.
    Recycled,
    /// Stopped heartbeating.
    Stuck,
    /// Resident memory exceeded the configured ceiling.
    OutOfMemory {
        /// Offending sample, in MiB.
        memory_mb: u64,
    },
    /// Process exited without being asked to, or its channel broke.
    Crashed {
        /// Exit code, if any.
        code: Option<i32>,
    },
    /// Pool shutdown.
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recycled => write!(f, "recycled"),
            Self::Stuck => write!(f, "stuck"),
            Self::OutOfMemory { memory_mb } => write!(f, "out of memory ({memory_mb}MiB)"),
            Self::Crashed { code: Some(code) } => write!(f, "crashed (exit code {code})"),
            Self::Crashed { code: None } => write!(f, "crashed"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl TerminationReason {
    /// Error delivered to a caller whose request was in flight on the
    /// terminated worker.
    pub(crate) fn in_flight_error(
        &self,
        worker_id: WorkerId,
        last_memory_mb: Option<u64>,
        limit_mb: u64,
        request_id: &str,
        waited_ms: u64,
    ) -> ConcurrencyError {
        let timeout = || ConcurrencyError::WorkerTimeout {
            request_id: request_id.to_string(),
            waited_ms,
        };
        match self {
            Self::OutOfMemory { memory_mb } => ConcurrencyError::WorkerOom {
                worker_id,
                memory_mb: *memory_mb,
                limit_mb,
            },
            Self::Crashed { .. } => match last_memory_mb {
                Some(memory_mb) if memory_mb > limit_mb => ConcurrencyError::WorkerOom {
                    worker_id,
                    memory_mb,
                    limit_mb,
                },
                _ => timeout(),
            },
            Self::Shutdown => ConcurrencyError::shutting_down(),
            Self::Recycled | Self::Stuck => timeout(),
        }
    }

    /// Whether the worker gets a `Shutdown` message before being killed.
    const fn is_planned(&self) -> bool {
        matches!(self, Self::Recycled | Self::Shutdown)
    }
}

/// Channel on which a caller waits for its reply.
pub(crate) type Reply = oneshot::Sender<PoolResult<WorkerResponse>>;

/// A request dispatched to a worker and not yet answered.
#[derive(Debug)]
pub(crate) struct ActiveRequest {
    pub request_id: RequestId,
    pub dispatched_at: Instant,
    /// `None` once the caller has timed out.
    pub reply: Option<Reply>,
}

/// Reply matched against the worker's in-flight request.
#[derive(Debug)]
pub(crate) struct Completion {
    pub active: ActiveRequest,
    /// Worker reached its request budget.
    pub retire: bool,
}

/// What a terminated slot left behind.
pub(crate) struct Retired {
    pub info: WorkerInfo,
    pub handle: Option<Arc<dyn SubprocessHandle>>,
    pub active: Option<ActiveRequest>,
}

struct WorkerSlot {
    info: WorkerInfo,
    handle: Option<Arc<dyn SubprocessHandle>>,
    current: Option<ActiveRequest>,
    suspect_since: Option<Instant>,
    retiring: bool,
}

/// Registry of every worker the pool knows about, keyed by id.
#[derive(Default)]
pub(crate) struct WorkerRegistry {
    workers: BTreeMap<u64, WorkerSlot>,
    next_id: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot in `Starting` state. Counts towards the live size
    /// immediately so concurrent decisions see it.
    pub fn reserve(&mut self, now: Instant) -> WorkerId {
        let worker_id = WorkerId(self.next_id);
        self.next_id += 1;
        self.workers.insert(
            worker_id.0,
            WorkerSlot {
                info: WorkerInfo {
                    worker_id,
                    pid: None,
                    state: WorkerState::Starting,
                    spawned_at: now,
                    last_heartbeat_at: now,
                    requests_processed: 0,
                    memory_usage_mb: None,
                    suspect: false,
                },
                handle: None,
                current: None,
                suspect_since: None,
                retiring: false,
            },
        );
        worker_id
    }

    /// Attach a spawned process to a reserved slot and mark it idle.
    /// Returns `None` if the slot was removed while spawning.
    pub fn activate(
        &mut self,
        worker_id: WorkerId,
        handle: Arc<dyn SubprocessHandle>,
        now: Instant,
    ) -> Option<WorkerInfo> {
        let slot = self.workers.get_mut(&worker_id.0)?;
        slot.info.pid = Some(handle.pid());
        slot.info.state = WorkerState::Idle;
        slot.info.last_heartbeat_at = now;
        slot.handle = Some(handle);
        Some(slot.info.clone())
    }

    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|s| s.info.state.is_live()).count()
    }

    pub fn count(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|s| s.info.state == state).count()
    }

    /// Lowest-numbered idle worker eligible for assignment.
    pub fn next_idle(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|s| {
                s.info.state == WorkerState::Idle
                    && !s.info.suspect
                    && !s.retiring
                    && s.handle.is_some()
            })
            .map(|s| s.info.worker_id)
    }

    /// Mark `worker_id` busy with `active` and return its handle.
    pub fn begin_request(
        &mut self,
        worker_id: WorkerId,
        active: ActiveRequest,
    ) -> Option<Arc<dyn SubprocessHandle>> {
        let slot = self.workers.get_mut(&worker_id.0)?;
        slot.info.state = WorkerState::Busy;
        slot.current = Some(active);
        slot.handle.clone()
    }

    /// Match a reply to the worker's in-flight request. Replies for any
    /// other request are stale and ignored.
    pub fn complete(
        &mut self,
        worker_id: WorkerId,
        request_id: &str,
        max_requests: u64,
    ) -> Option<Completion> {
        let slot = self.workers.get_mut(&worker_id.0)?;
        if slot.current.as_ref().map(|a| a.request_id.as_str()) != Some(request_id) {
            return None;
        }
        let active = slot.current.take()?;
        slot.info.requests_processed += 1;
        slot.info.suspect = false;
        slot.suspect_since = None;
        if slot.info.state == WorkerState::Busy {
            slot.info.state = WorkerState::Idle;
        }
        if slot.info.requests_processed >= max_requests {
            slot.retiring = true;
        }
        Some(Completion {
            active,
            retire: slot.retiring,
        })
    }

    /// Refresh liveness, optionally recording a memory sample.
    pub fn record_heartbeat(&mut self, worker_id: WorkerId, memory_mb: Option<u64>, now: Instant) {
        if let Some(slot) = self.workers.get_mut(&worker_id.0) {
            slot.info.last_heartbeat_at = now;
            if memory_mb.is_some() {
                slot.info.memory_usage_mb = memory_mb;
            }
        }
    }

    pub fn record_memory(&mut self, worker_id: WorkerId, memory_mb: u64) {
        if let Some(slot) = self.workers.get_mut(&worker_id.0) {
            slot.info.memory_usage_mb = Some(memory_mb);
        }
    }

    /// Flag the worker running `request_id` as suspect and detach the
    /// caller's reply channel.
    pub fn mark_suspect(&mut self, request_id: &str, now: Instant) -> Option<WorkerId> {
        let slot = self.workers.values_mut().find(|s| {
            s.current
                .as_ref()
                .is_some_and(|a| a.request_id == request_id)
        })?;
        if let Some(active) = slot.current.as_mut() {
            active.reply = None;
        }
        slot.info.suspect = true;
        slot.suspect_since = Some(now);
        Some(slot.info.worker_id)
    }

    /// Flag a worker as stuck so it is never assigned again.
    pub fn mark_stuck(&mut self, worker_id: WorkerId) {
        if let Some(slot) = self.workers.get_mut(&worker_id.0) {
            slot.info.state = WorkerState::Stuck;
        }
    }

    /// Remove a worker, returning what the caller must clean up.
    pub fn retire(&mut self, worker_id: WorkerId) -> Option<Retired> {
        let mut slot = self.workers.remove(&worker_id.0)?;
        slot.info.state = WorkerState::Terminating;
        Some(Retired {
            info: slot.info,
            handle: slot.handle,
            active: slot.current,
        })
    }

    /// Remove every worker.
    pub fn retire_all(&mut self) -> Vec<Retired> {
        let ids: Vec<u64> = self.workers.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.retire(WorkerId(id)))
            .collect()
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&WorkerInfo> {
        self.workers.get(&worker_id.0).map(|s| &s.info)
    }

    pub fn suspect_since(&self, worker_id: WorkerId) -> Option<Instant> {
        self.workers.get(&worker_id.0).and_then(|s| s.suspect_since)
    }

    pub fn in_flight(&self, worker_id: WorkerId) -> Option<&RequestId> {
        self.workers
            .get(&worker_id.0)
            .and_then(|s| s.current.as_ref())
            .map(|a| &a.request_id)
    }

    /// Whether any request is dispatched and still awaited by its caller.
    pub fn has_awaited_requests(&self) -> bool {
        self.workers
            .values()
            .any(|s| s.current.as_ref().is_some_and(|a| a.reply.is_some()))
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers.values().map(|s| s.info.clone()).collect()
    }

    /// Live, spawned workers with their handles, for memory sampling.
    pub fn sampling_targets(&self) -> Vec<(WorkerId, Arc<dyn SubprocessHandle>, Option<u64>)> {
        self.workers
            .values()
            .filter(|s| matches!(s.info.state, WorkerState::Idle | WorkerState::Busy))
            .filter_map(|s| {
                s.handle
                    .as_ref()
                    .map(|h| (s.info.worker_id, Arc::clone(h), s.info.memory_usage_mb))
            })
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.keys().map(|id| WorkerId(*id))
    }

    /// Slots needed to bring the live count up to `min_workers`.
    pub fn replacements_needed(&self, min_workers: usize) -> usize {
        min_workers.saturating_sub(self.live_count())
    }
}

impl PoolInner {
    fn subprocess_config(&self, worker_id: WorkerId) -> SubprocessConfig {
        SubprocessConfig {
            worker_id,
            timeout_ms: self.config.worker_timeout_ms,
            memory_limit_mb: self.config.memory_limit_mb,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
        }
    }

    /// Spawn workers until the live count reaches `min_workers`.
    pub(crate) async fn ensure_min_workers(self: &Arc<Self>) -> PoolResult<()> {
        if self.is_shutting_down() {
            return Ok(());
        }
        let reserved: Vec<WorkerId> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let needed = state.registry.replacements_needed(self.config.min_workers);
            (0..needed).map(|_| state.registry.reserve(now)).collect()
        };
        if reserved.is_empty() {
            return Ok(());
        }
        debug!(count = reserved.len(), "spawning workers to reach minimum");
        let results = join_all(reserved.into_iter().map(|id| Arc::clone(self).spawn_reserved(id))).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Reserve a slot for one more worker and start it in the background.
    ///
    /// Runs inside the caller's critical section so the reservation is
    /// visible to the next capacity check.
    ///
    /// # Errors
    ///
    /// - [`ConcurrencyError::Backpressure`] once shutdown has begun
    /// - [`ConcurrencyError::Spawn`] if the pool is already at `max_workers`
    pub(crate) fn spawn_one(self: &Arc<Self>, state: &mut PoolState) -> PoolResult<WorkerId> {
        if self.is_shutting_down() {
            return Err(ConcurrencyError::shutting_down());
        }
        if state.registry.live_count() >= self.config.max_workers {
            return Err(ConcurrencyError::Spawn(format!(
                "pool already at max_workers ({})",
                self.config.max_workers
            )));
        }
        let worker_id = state.registry.reserve(Instant::now());
        tokio::spawn(Arc::clone(self).spawn_reserved(worker_id));
        Ok(worker_id)
    }

    /// Start the process for a slot reserved with [`WorkerRegistry::reserve`].
    pub(crate) async fn spawn_reserved(self: Arc<Self>, worker_id: WorkerId) -> PoolResult<WorkerInfo> {
        let config = self.subprocess_config(worker_id);
        match self.factory.spawn(&config).await {
            Ok(SpawnedProcess { handle, events }) => {
                let activated = {
                    let mut state = self.state.lock();
                    let info = state
                        .registry
                        .activate(worker_id, Arc::clone(&handle), Instant::now());
                    if let Some(info) = &info {
                        self.sink.publish(PoolEvent::WorkerSpawned(WorkerSpawned {
                            worker_id,
                            pid: handle.pid(),
                            timestamp_ms: now_ms(),
                        }));
                        debug!(worker_id = %info.worker_id, "worker slot activated");
                    }
                    info
                };
                let Some(info) = activated else {
                    // Slot vanished (pool shut down mid-spawn).
                    handle.kill();
                    return Err(ConcurrencyError::shutting_down());
                };
                tokio::spawn(watch_worker(Arc::downgrade(&self), worker_id, events));
                self.pump();
                Ok(info)
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "failed to spawn worker");
                let err = ConcurrencyError::Spawn(e.to_string());
                let stranded = {
                    let mut state = self.state.lock();
                    state.registry.retire(worker_id);
                    if state.registry.live_count() == 0 {
                        state.scheduler.drain()
                    } else {
                        Vec::new()
                    }
                };
                if !stranded.is_empty() {
                    warn!(count = stranded.len(), "no live workers; failing queued requests");
                }
                for entry in stranded {
                    let _ = entry.payload.reply.send(Err(err.clone()));
                }
                self.progress.notify_waiters();
                Err(err)
            }
        }
    }

    /// Retire a worker once it is done with its current request.
    pub(crate) fn recycle(self: &Arc<Self>, worker_id: WorkerId) {
        let idle = {
            let state = self.state.lock();
            state
                .registry
                .get(worker_id)
                .is_some_and(|info| info.state != WorkerState::Busy)
        };
        if idle {
            self.terminate(worker_id, TerminationReason::Recycled);
        }
    }

    /// Remove a worker now, fail its in-flight request, kill the process and
    /// reserve replacements in the same critical section.
    pub(crate) fn terminate(self: &Arc<Self>, worker_id: WorkerId, reason: TerminationReason) {
        let (retired, replacements) = {
            let mut state = self.state.lock();
            let Some(retired) = state.registry.retire(worker_id) else {
                return;
            };
            self.sink.publish(PoolEvent::WorkerRecycled(WorkerRecycled {
                worker_id,
                reason: reason.clone(),
                requests_processed: retired.info.requests_processed,
                timestamp_ms: now_ms(),
            }));
            let replacements: Vec<WorkerId> = if self.is_shutting_down() {
                Vec::new()
            } else {
                let now = Instant::now();
                let needed = state.registry.replacements_needed(self.config.min_workers);
                (0..needed).map(|_| state.registry.reserve(now)).collect()
            };
            (retired, replacements)
        };

        info!(
            worker_id = %worker_id,
            reason = %reason,
            requests_processed = retired.info.requests_processed,
            replacements = replacements.len(),
            "terminating worker"
        );

        if let Some(active) = retired.active {
            if let Some(reply) = active.reply {
                let err = reason.in_flight_error(
                    worker_id,
                    retired.info.memory_usage_mb,
                    self.config.memory_limit_mb,
                    &active.request_id,
                    duration_ms(active.dispatched_at.elapsed()),
                );
                let _ = reply.send(Err(err));
            }
        }

        if let Some(handle) = retired.handle {
            stop_process(handle, reason.is_planned());
        }

        for id in replacements {
            tokio::spawn(Arc::clone(self).spawn_reserved(id));
        }
        self.progress.notify_waiters();
        self.pump();
    }

    /// Apply one message from a worker.
    fn on_worker_message(self: &Arc<Self>, worker_id: WorkerId, message: WorkerMessage) {
        let now = Instant::now();
        let (request_id, outcome) = match message {
            WorkerMessage::Ready => {
                self.state.lock().registry.record_heartbeat(worker_id, None, now);
                debug!(worker_id = %worker_id, "worker ready");
                return;
            }
            WorkerMessage::Heartbeat { memory_mb } => {
                self.state
                    .lock()
                    .registry
                    .record_heartbeat(worker_id, memory_mb, now);
                return;
            }
            WorkerMessage::Result { request_id, result } => (request_id, WorkerOutcome::Success(result)),
            WorkerMessage::Error { request_id, message } => (request_id, WorkerOutcome::Failure(message)),
        };

        let completion = {
            let mut state = self.state.lock();
            state.registry.record_heartbeat(worker_id, None, now);
            state
                .registry
                .complete(worker_id, &request_id, self.config.max_requests_per_worker)
        };
        let Some(Completion { active, retire }) = completion else {
            debug!(worker_id = %worker_id, request_id = %request_id, "ignoring stale reply");
            return;
        };

        match active.reply {
            Some(reply) => {
                let response = WorkerResponse {
                    request_id,
                    worker_id,
                    outcome,
                    processing_time_ms: duration_ms(now.saturating_duration_since(active.dispatched_at)),
                };
                let _ = reply.send(Ok(response));
            }
            None => debug!(worker_id = %worker_id, request_id = %request_id, "late reply after timeout"),
        }

        self.progress.notify_waiters();
        if retire {
            self.recycle(worker_id);
        } else {
            self.pump();
        }
    }

    /// Handle a process exit. Exits of workers already removed are expected.
    fn on_worker_exit(self: &Arc<Self>, worker_id: WorkerId, code: Option<i32>) {
        let known = self.state.lock().registry.get(worker_id).is_some();
        if known {
            warn!(worker_id = %worker_id, ?code, "worker exited unexpectedly");
            self.terminate(worker_id, TerminationReason::Crashed { code });
        } else {
            debug!(worker_id = %worker_id, ?code, "worker process reaped");
        }
    }
}

/// Stop a process. Planned stops get a `Shutdown` message first.
pub(crate) fn stop_process(handle: Arc<dyn SubprocessHandle>, graceful: bool) {
    if graceful {
        tokio::spawn(async move {
            if let Err(e) = handle.send(&ParentMessage::Shutdown).await {
                debug!(pid = handle.pid(), error = %e, "worker gone before shutdown message");
            }
            handle.kill();
        });
    } else {
        handle.kill();
    }
}

/// Forward a worker's events to the pool until it exits or the pool is
/// dropped.
async fn watch_worker(
    pool: Weak<PoolInner>,
    worker_id: WorkerId,
    mut events: mpsc::UnboundedReceiver<SubprocessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        match event {
            SubprocessEvent::Message(message) => inner.on_worker_message(worker_id, message),
            SubprocessEvent::Exited { code } => {
                inner.on_worker_exit(worker_id, code);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;
    use async_trait::async_trait;

    struct FakeHandle(u32);

    #[async_trait]
    impl SubprocessHandle for FakeHandle {
        fn pid(&self) -> u32 {
            self.0
        }
        async fn send(&self, _message: &ParentMessage) -> Result<(), ProcessError> {
            Ok(())
        }
        fn kill(&self) {}
        async fn memory_usage_mb(&self) -> Option<u64> {
            None
        }
    }

    fn active(id: &str) -> ActiveRequest {
        ActiveRequest {
            request_id: id.to_string(),
            dispatched_at: Instant::now(),
            reply: None,
        }
    }

    fn registry_with(n: u32) -> WorkerRegistry {
        let mut reg = WorkerRegistry::new();
        let now = Instant::now();
        for pid in 0..n {
            let id = reg.reserve(now);
            reg.activate(id, Arc::new(FakeHandle(1000 + pid)), now).unwrap();
        }
        reg
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut reg = WorkerRegistry::new();
        let now = Instant::now();
        assert_eq!(reg.reserve(now), WorkerId(0));
        assert_eq!(reg.reserve(now), WorkerId(1));
        assert_eq!(reg.live_count(), 2);
        assert_eq!(reg.count(WorkerState::Starting), 2);
        assert_eq!(reg.next_idle(), None);
    }

    #[test]
    fn test_next_idle_prefers_lowest_id() {
        let mut reg = registry_with(2);
        assert_eq!(reg.next_idle(), Some(WorkerId(0)));
        reg.begin_request(WorkerId(0), active("r1")).unwrap();
        assert_eq!(reg.next_idle(), Some(WorkerId(1)));
        assert_eq!(reg.count(WorkerState::Busy), 1);
    }

    #[test]
    fn test_complete_matches_in_flight_request() {
        let mut reg = registry_with(1);
        reg.begin_request(WorkerId(0), active("r1")).unwrap();
        assert!(reg.complete(WorkerId(0), "other", 10).is_none());

        let done = reg.complete(WorkerId(0), "r1", 10).unwrap();
        assert_eq!(done.active.request_id, "r1");
        assert!(!done.retire);
        let info = reg.get(WorkerId(0)).unwrap();
        assert_eq!(info.state, WorkerState::Idle);
        assert_eq!(info.requests_processed, 1);
    }

    #[test]
    fn test_budget_marks_retiring() {
        let mut reg = registry_with(1);
        reg.begin_request(WorkerId(0), active("r1")).unwrap();
        assert!(reg.complete(WorkerId(0), "r1", 1).unwrap().retire);
        assert_eq!(reg.next_idle(), None);
    }

    #[test]
    fn test_suspect_excluded_until_reply() {
        let mut reg = registry_with(1);
        reg.begin_request(WorkerId(0), active("r1")).unwrap();
        assert_eq!(reg.mark_suspect("r1", Instant::now()), Some(WorkerId(0)));
        assert!(reg.get(WorkerId(0)).unwrap().suspect);
        assert!(reg.suspect_since(WorkerId(0)).is_some());
        assert!(!reg.has_awaited_requests());

        reg.complete(WorkerId(0), "r1", 10).unwrap();
        assert!(!reg.get(WorkerId(0)).unwrap().suspect);
        assert_eq!(reg.next_idle(), Some(WorkerId(0)));
    }

    #[test]
    fn test_retire_and_replacements() {
        let mut reg = registry_with(2);
        reg.mark_stuck(WorkerId(1));
        assert_eq!(reg.live_count(), 1);
        assert_eq!(reg.replacements_needed(2), 1);

        let retired = reg.retire(WorkerId(1)).unwrap();
        assert_eq!(retired.info.state, WorkerState::Terminating);
        assert!(retired.handle.is_some());
        assert!(reg.retire(WorkerId(1)).is_none());
        assert_eq!(reg.retire_all().len(), 1);
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn test_in_flight_error_mapping() {
        let oom = TerminationReason::OutOfMemory { memory_mb: 600 }.in_flight_error(
            WorkerId(2),
            None,
            512,
            "r1",
            10,
        );
        assert_eq!(
            oom,
            ConcurrencyError::WorkerOom {
                worker_id: WorkerId(2),
                memory_mb: 600,
                limit_mb: 512
            }
        );

        let crash = TerminationReason::Crashed { code: Some(137) };
        assert_eq!(crash.in_flight_error(WorkerId(0), Some(900), 512, "r1", 5).kind(), "worker_oom");
        assert_eq!(crash.in_flight_error(WorkerId(0), Some(100), 512, "r1", 5).kind(), "worker_timeout");
        assert_eq!(
            TerminationReason::Shutdown.in_flight_error(WorkerId(0), None, 512, "r1", 5),
            ConcurrencyError::shutting_down()
        );
    }

    #[test]
    fn test_reason_serde_and_display() {
        let json = serde_json::to_string(&TerminationReason::OutOfMemory { memory_mb: 700 }).unwrap();
        assert_eq!(json, r#"{"kind":"out_of_memory","memory_mb":700}"#);
        assert_eq!(TerminationReason::Crashed { code: None }.to_string(), "crashed");
    }
}
