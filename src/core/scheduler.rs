//! Priority scheduler: one FIFO per priority level under a hard cap.

use std::collections::{BTreeMap, VecDeque};

use crate::core::error::ConcurrencyError;
use crate::core::types::{Priority, QueueEntry};

/// Admission-ordered queue with a hard capacity bound.
///
/// `dequeue` always yields the oldest entry of the highest non-empty
/// priority. Higher priorities may starve lower ones.
pub struct PriorityScheduler<P> {
    max_queue_size: usize,
    /// Sub-queues indexed by [`Priority::index`].
    queues: [VecDeque<QueueEntry<P>>; 3],
}

impl<P> PriorityScheduler<P> {
    /// Create a scheduler holding at most `max_queue_size` entries.
    #[must_use]
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
        }
    }

    /// Enqueue an entry if the hard cap permits, regardless of its priority.
    ///
    /// # Errors
    ///
    /// [`ConcurrencyError::QueueFull`] when the queue is at capacity.
    pub fn enqueue(&mut self, entry: QueueEntry<P>) -> Result<(), ConcurrencyError> {
        if self.len() >= self.max_queue_size {
            return Err(ConcurrencyError::QueueFull {
                max_queue_size: self.max_queue_size,
            });
        }
        self.queues[entry.priority.index()].push_back(entry);
        Ok(())
    }

    /// Pop the oldest entry of the highest non-empty priority.
    pub fn dequeue(&mut self) -> Option<QueueEntry<P>> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.queues[p.index()].pop_front())
    }

    /// Priority of the entry `dequeue` would return next.
    #[must_use]
    pub fn peek_priority(&self) -> Option<Priority> {
        Priority::DESCENDING
            .into_iter()
            .find(|p| !self.queues[p.index()].is_empty())
    }

    /// Remove a queued entry by request id.
    pub fn remove(&mut self, request_id: &str) -> Option<QueueEntry<P>> {
        self.queues.iter_mut().find_map(|q| {
            q.iter()
                .position(|e| e.request_id == request_id)
                .and_then(|pos| q.remove(pos))
        })
    }

    /// Take every queued entry in dequeue order.
    pub fn drain(&mut self) -> Vec<QueueEntry<P>> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(entry) = self.dequeue() {
            out.push(entry);
        }
        out
    }

    /// Total queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Queued entries per priority level (every level present).
    #[must_use]
    pub fn len_by_priority(&self) -> BTreeMap<Priority, usize> {
        Priority::DESCENDING
            .into_iter()
            .map(|p| (p, self.queues[p.index()].len()))
            .collect()
    }

    /// Configured hard cap.
    #[must_use]
    pub const fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }
}
