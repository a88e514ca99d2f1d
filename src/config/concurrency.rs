//! Concurrency configuration for a worker pool.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix for environment variables read by [`ConcurrencyConfig::from_env`].
pub const ENV_PREFIX: &str = "AGENT_POOL_";

/// Immutable tunables for a [`WorkerPool`](crate::core::WorkerPool).
///
/// Loaded once at pool construction; a new pool must be built to change
/// any limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Upper bound on live worker processes.
    pub max_workers: usize,
    /// Lower bound on live worker processes, kept warm at all times.
    pub min_workers: usize,
    /// Hard cap on queued requests across all priorities.
    pub max_queue_size: usize,
    /// Default (and maximum) time to wait for a worker reply.
    pub worker_timeout_ms: u64,
    /// Requests a worker serves before it is recycled.
    pub max_requests_per_worker: u64,
    /// Resident memory ceiling per worker, in MiB.
    pub memory_limit_mb: u64,
    /// Fraction of `max_queue_size` at which non-high work is rejected.
    pub backpressure_threshold: f64,
    /// Health tick period, and the cadence workers are expected to heartbeat at.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence after which a worker is considered stuck.
    pub stuck_threshold_ms: u64,
    /// Maximum wait for a session lock. `None` uses the request timeout.
    pub session_lock_timeout_ms: Option<u64>,
    /// How long `shutdown` waits for queued and in-flight work to finish.
    pub shutdown_grace_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().clamp(1, 8),
            min_workers: 1,
            max_queue_size: 32,
            worker_timeout_ms: 120_000,
            max_requests_per_worker: 100,
            memory_limit_mb: 512,
            backpressure_threshold: 0.7,
            heartbeat_interval_ms: 5_000,
            stuck_threshold_ms: 60_000,
            session_lock_timeout_ms: None,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl ConcurrencyConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of workers.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the minimum number of workers.
    #[must_use]
    pub const fn with_min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers;
        self
    }

    /// Set the hard queue cap.
    #[must_use]
    pub const fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub const fn with_worker_timeout_ms(mut self, worker_timeout_ms: u64) -> Self {
        self.worker_timeout_ms = worker_timeout_ms;
        self
    }

    /// Set the per-worker request budget before recycling.
    #[must_use]
    pub const fn with_max_requests_per_worker(mut self, max_requests: u64) -> Self {
        self.max_requests_per_worker = max_requests;
        self
    }

    /// Set the per-worker memory ceiling.
    #[must_use]
    pub const fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    /// Set the backpressure threshold as a fraction of the queue cap.
    #[must_use]
    pub const fn with_backpressure_threshold(mut self, threshold: f64) -> Self {
        self.backpressure_threshold = threshold;
        self
    }

    /// Set the health tick period.
    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set the stuck-worker heartbeat threshold.
    #[must_use]
    pub const fn with_stuck_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.stuck_threshold_ms = threshold_ms;
        self
    }

    /// Set an explicit session lock timeout.
    #[must_use]
    pub const fn with_session_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.session_lock_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the shutdown drain grace period.
    #[must_use]
    pub const fn with_shutdown_grace_ms(mut self, grace_ms: u64) -> Self {
        self.shutdown_grace_ms = grace_ms;
        self
    }

    /// Default request timeout as a [`Duration`].
    #[must_use]
    pub const fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    /// Health tick period as a [`Duration`].
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Stuck threshold as a [`Duration`].
    #[must_use]
    pub const fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be greater than 0".into());
        }
        if self.min_workers > self.max_workers {
            return Err(format!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".into());
        }
        if self.worker_timeout_ms == 0 {
            return Err("worker_timeout_ms must be greater than 0".into());
        }
        if self.max_requests_per_worker == 0 {
            return Err("max_requests_per_worker must be greater than 0".into());
        }
        if self.memory_limit_mb == 0 {
            return Err("memory_limit_mb must be greater than 0".into());
        }
        if !(self.backpressure_threshold > 0.0 && self.backpressure_threshold <= 1.0) {
            return Err(format!(
                "backpressure_threshold must be in (0, 1], got {}",
                self.backpressure_threshold
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".into());
        }
        if self.stuck_threshold_ms == 0 {
            return Err("stuck_threshold_ms must be greater than 0".into());
        }
        if self.session_lock_timeout_ms == Some(0) {
            return Err("session_lock_timeout_ms must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `AGENT_POOL_*` environment variables, loading
    /// a `.env` file first if present, then validate.
    ///
    /// Unset variables keep their default values, e.g. `AGENT_POOL_MAX_WORKERS=4`.
    ///
    /// # Errors
    ///
    /// Returns a description of an unparsable variable or a validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(v) = env_var("MAX_WORKERS")? {
            cfg.max_workers = v;
        }
        if let Some(v) = env_var("MIN_WORKERS")? {
            cfg.min_workers = v;
        }
        if let Some(v) = env_var("MAX_QUEUE_SIZE")? {
            cfg.max_queue_size = v;
        }
        if let Some(v) = env_var("WORKER_TIMEOUT_MS")? {
            cfg.worker_timeout_ms = v;
        }
        if let Some(v) = env_var("MAX_REQUESTS_PER_WORKER")? {
            cfg.max_requests_per_worker = v;
        }
        if let Some(v) = env_var("MEMORY_LIMIT_MB")? {
            cfg.memory_limit_mb = v;
        }
        if let Some(v) = env_var("BACKPRESSURE_THRESHOLD")? {
            cfg.backpressure_threshold = v;
        }
        if let Some(v) = env_var("HEARTBEAT_INTERVAL_MS")? {
            cfg.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_var("STUCK_THRESHOLD_MS")? {
            cfg.stuck_threshold_ms = v;
        }
        if let Some(v) = env_var("SESSION_LOCK_TIMEOUT_MS")? {
            cfg.session_lock_timeout_ms = Some(v);
        }
        if let Some(v) = env_var("SHUTDOWN_GRACE_MS")? {
            cfg.shutdown_grace_ms = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    match std::env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{key}: {e}")),
        Err(_) => Ok(None),
    }
}
