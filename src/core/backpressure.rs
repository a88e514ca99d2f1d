//! Load-based admission gate evaluated ahead of the scheduler's hard cap.

use tracing::{info, warn};

use crate::core::error::ConcurrencyError;
use crate::core::events::BackpressureActivated;
use crate::core::types::Priority;
use crate::util::clock::now_ms;

/// Rejects non-top-priority work once the queue load crosses a threshold.
#[derive(Debug, Clone)]
pub struct BackpressureMonitor {
    max_queue_size: usize,
    threshold: f64,
    active: bool,
}

impl BackpressureMonitor {
    /// Create a monitor for a queue of `max_queue_size` with the given
    /// activation `threshold` (fraction of the cap).
    #[must_use]
    pub const fn new(max_queue_size: usize, threshold: f64) -> Self {
        Self {
            max_queue_size,
            threshold,
            active: false,
        }
    }

    /// Queue load as a fraction of the hard cap.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn current_load(&self, queue_len: usize) -> f64 {
        if self.max_queue_size == 0 {
            return 1.0;
        }
        queue_len as f64 / self.max_queue_size as f64
    }

    /// Whether backpressure was active at the last observation.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Record the current queue length. Returns the activation payload on
    /// the inactive → active transition only.
    pub fn observe(&mut self, queue_len: usize) -> Option<BackpressureActivated> {
        let load = self.current_load(queue_len);
        let now_active = load >= self.threshold;
        let was_active = std::mem::replace(&mut self.active, now_active);
        match (was_active, now_active) {
            (false, true) => {
                warn!(load, threshold = self.threshold, queue_len, "backpressure activated");
                Some(BackpressureActivated {
                    load,
                    threshold: self.threshold,
                    queue_length: queue_len,
                    timestamp_ms: now_ms(),
                })
            }
            (true, false) => {
                info!(load, queue_len, "backpressure released");
                None
            }
            _ => None,
        }
    }

    /// Decide whether a request of `priority` may enter a queue currently
    /// holding `queue_len` entries.
    ///
    /// # Errors
    ///
    /// [`ConcurrencyError::Backpressure`] when load is at or above the
    /// threshold and `priority` is not the highest level.
    pub fn admit(&self, priority: Priority, queue_len: usize) -> Result<(), ConcurrencyError> {
        let load = self.current_load(queue_len);
        if load < self.threshold || priority == Priority::highest() {
            return Ok(());
        }
        Err(ConcurrencyError::Backpressure {
            reason: format!(
                "queue load {load:.2} at or above threshold {:.2}; only {} priority admitted",
                self.threshold,
                Priority::highest()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_fraction() {
        let m = BackpressureMonitor::new(10, 0.7);
        assert!((m.current_load(0) - 0.0).abs() < f64::EPSILON);
        assert!((m.current_load(7) - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_admits_all_below_threshold() {
        let m = BackpressureMonitor::new(10, 0.7);
        for p in Priority::DESCENDING {
            assert!(m.admit(p, 6).is_ok());
        }
    }

    #[test]
    fn test_only_high_at_threshold() {
        let m = BackpressureMonitor::new(10, 0.7);
        assert!(m.admit(Priority::High, 7).is_ok());
        assert!(m.admit(Priority::High, 9).is_ok());
        let err = m.admit(Priority::Normal, 7).unwrap_err();
        assert!(matches!(err, ConcurrencyError::Backpressure { .. }));
        assert!(err.to_string().contains("high load"));
        assert!(m.admit(Priority::Low, 8).is_err());
    }

    #[test]
    fn test_activation_emitted_once_per_transition() {
        let mut m = BackpressureMonitor::new(10, 0.5);
        assert!(m.observe(4).is_none());
        let evt = m.observe(5).unwrap();
        assert_eq!(evt.queue_length, 5);
        assert!(m.is_active());
        assert!(m.observe(6).is_none());
        assert!(m.observe(9).is_none());

        assert!(m.observe(2).is_none());
        assert!(!m.is_active());
        assert!(m.observe(5).is_some());
    }
}
