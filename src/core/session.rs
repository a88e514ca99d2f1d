//! Per-session mutual exclusion with FIFO hand-off.
//!
//! A [`MutexHandle`] is the only proof that a caller holds a session.
//! Waiters are granted in `acquire` order; a waiter that gives up (timeout or
//! dropped future) is removed so a grant is never handed to nobody.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::error::ConcurrencyError;
use crate::core::types::SessionId;
use crate::util::clock::duration_ms;

/// Opaque proof of exclusive access to a session. Pass it to
/// [`SessionMutex::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a session stays locked until its handle is released"]
pub struct MutexHandle {
    session_id: SessionId,
    token: u64,
}

impl MutexHandle {
    /// Session this handle locks.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

struct SessionSlot {
    holder: u64,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

/// Table of session locks.
#[derive(Default)]
pub struct SessionMutex {
    sessions: Mutex<HashMap<SessionId, SessionSlot>>,
    next_token: AtomicU64,
}

impl SessionMutex {
    /// Create an empty session table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `session_id`, waiting behind earlier callers.
    ///
    /// With `timeout = None` the caller waits indefinitely.
    ///
    /// # Errors
    ///
    /// [`ConcurrencyError::LockAcquisition`] if not granted within `timeout`.
    pub async fn acquire(
        &self,
        session_id: &str,
        timeout: Option<Duration>,
    ) -> Result<MutexHandle, ConcurrencyError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let rx = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(session_id) {
                None => {
                    sessions.insert(
                        session_id.to_owned(),
                        SessionSlot {
                            holder: token,
                            waiters: VecDeque::new(),
                        },
                    );
                    debug!(session_id, "session lock granted immediately");
                    return Ok(MutexHandle {
                        session_id: session_id.to_owned(),
                        token,
                    });
                }
                Some(slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push_back((token, tx));
                    debug!(session_id, waiters = slot.waiters.len(), "waiting for session lock");
                    rx
                }
            }
        };

        let mut waiter = Waiter {
            mutex: self,
            session_id,
            token,
            armed: true,
        };

        let granted = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.ok(),
            None => Some(rx.await),
        };

        if matches!(granted, Some(Ok(()))) {
            waiter.armed = false;
            return Ok(MutexHandle {
                session_id: session_id.to_owned(),
                token,
            });
        }

        // Timed out: the grant may have raced the deadline.
        waiter.armed = false;
        if self.withdraw(session_id, token) {
            return Ok(MutexHandle {
                session_id: session_id.to_owned(),
                token,
            });
        }
        Err(ConcurrencyError::LockAcquisition {
            session_id: session_id.to_owned(),
            timeout_ms: timeout.map_or(0, duration_ms),
        })
    }

    /// Release a held session, handing it to the earliest waiter if any.
    pub fn release(&self, handle: MutexHandle) {
        let mut sessions = self.sessions.lock();
        Self::hand_off(&mut sessions, &handle.session_id, handle.token);
    }

    /// Whether `session_id` is currently held.
    #[must_use]
    pub fn is_locked(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Callers waiting on `session_id`.
    #[must_use]
    pub fn waiting(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .map_or(0, |slot| slot.waiters.len())
    }

    /// Sessions currently held.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Remove a waiter that gave up. Returns `true` if it had already been
    /// granted the lock, in which case the caller now holds it.
    fn withdraw(&self, session_id: &str, token: u64) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(slot) = sessions.get_mut(session_id) else {
            return false;
        };
        if slot.holder == token {
            return true;
        }
        slot.waiters.retain(|(t, _)| *t != token);
        false
    }

    /// Drop-path cleanup: forget the waiter, passing on a grant it never used.
    fn abandon(&self, session_id: &str, token: u64) {
        let mut sessions = self.sessions.lock();
        let holds = match sessions.get_mut(session_id) {
            Some(slot) if slot.holder == token => true,
            Some(slot) => {
                slot.waiters.retain(|(t, _)| *t != token);
                false
            }
            None => false,
        };
        if holds {
            Self::hand_off(&mut sessions, session_id, token);
        }
    }

    fn hand_off(sessions: &mut HashMap<SessionId, SessionSlot>, session_id: &str, token: u64) {
        let Some(slot) = sessions.get_mut(session_id) else {
            warn!(session_id, "release of unknown session ignored");
            return;
        };
        if slot.holder != token {
            warn!(session_id, "release with stale handle ignored");
            return;
        }
        while let Some((next, tx)) = slot.waiters.pop_front() {
            slot.holder = next;
            if tx.send(()).is_ok() {
                debug!(session_id, "session lock handed to next waiter");
                return;
            }
        }
        sessions.remove(session_id);
        debug!(session_id, "session lock released");
    }
}

/// Cleans up a pending acquire whose future is dropped mid-wait.
struct Waiter<'a> {
    mutex: &'a SessionMutex,
    session_id: &'a str,
    token: u64,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.abandon(self.session_id, self.token);
        }
    }
}

/// Holds a session for the duration of a request and releases it on drop,
/// whatever the outcome.
pub(crate) struct SessionGuard {
    mutex: Arc<SessionMutex>,
    handle: Option<MutexHandle>,
}

impl SessionGuard {
    pub(crate) async fn acquire(
        mutex: Arc<SessionMutex>,
        session_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, ConcurrencyError> {
        let handle = mutex.acquire(session_id, timeout).await?;
        Ok(Self {
            mutex,
            handle: Some(handle),
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.mutex.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uncontended_acquire_release() {
        let mutex = SessionMutex::new();
        let handle = mutex.acquire("s1", None).await.unwrap();
        assert_eq!(handle.session_id(), "s1");
        assert!(mutex.is_locked("s1"));

        mutex.release(handle);
        assert!(!mutex.is_locked("s1"));
        assert_eq!(mutex.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_independent_sessions() {
        let mutex = SessionMutex::new();
        let a = mutex.acquire("a", None).await.unwrap();
        let b = mutex.acquire("b", Some(Duration::from_millis(10))).await.unwrap();
        assert_eq!(mutex.active_sessions(), 2);
        mutex.release(a);
        mutex.release(b);
    }

    #[tokio::test]
    async fn test_fifo_hand_off() {
        let mutex = Arc::new(SessionMutex::new());
        let first = mutex.acquire("s1", None).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let task_mutex = Arc::clone(&mutex);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let handle = task_mutex.acquire("s1", None).await.unwrap();
                order.lock().push(i);
                tokio::task::yield_now().await;
                task_mutex.release(handle);
            }));
            // Let each waiter register before the next one.
            while mutex.waiting("s1") <= i {
                tokio::task::yield_now().await;
            }
        }

        mutex.release(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(!mutex.is_locked("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let mutex = SessionMutex::new();
        let held = mutex.acquire("s1", None).await.unwrap();

        let err = mutex
            .acquire("s1", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ConcurrencyError::LockAcquisition {
                session_id: "s1".into(),
                timeout_ms: 50
            }
        );
        assert_eq!(mutex.waiting("s1"), 0);

        mutex.release(held);
        assert!(!mutex.is_locked("s1"));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_leak_lock() {
        let mutex = Arc::new(SessionMutex::new());
        let held = mutex.acquire("s1", None).await.unwrap();

        let waiter = {
            let mutex = Arc::clone(&mutex);
            tokio::spawn(async move {
                let _ = mutex.acquire("s1", None).await;
            })
        };
        while mutex.waiting("s1") == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(mutex.waiting("s1"), 0);
        mutex.release(held);
        assert!(!mutex.is_locked("s1"));
    }

    #[tokio::test]
    async fn test_stale_release_ignored() {
        let mutex = SessionMutex::new();
        let handle = mutex.acquire("s1", None).await.unwrap();
        let forged = MutexHandle {
            session_id: "s1".into(),
            token: handle.token + 100,
        };
        mutex.release(forged);
        assert!(mutex.is_locked("s1"));
        mutex.release(handle);
        assert!(!mutex.is_locked("s1"));
    }
}
