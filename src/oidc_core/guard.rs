//! Per-session mutual exclusion around token state changes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of one async lock per session id.
///
/// Entries are created on demand and removed again once the last holder or
/// waiter is gone, so the map only tracks sessions with work in flight.
#[derive(Clone, Default)]
pub struct SessionLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `session_id`.
    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        let lock = self.locks.entry(session_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let guard = lock.lock_owned().await;
        SessionGuard { locks: self.locks.clone(), session_id: session_id.to_string(), guard: Some(guard) }
    }

    /// Sessions that currently have a holder or a waiter.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Held for as long as the session is exclusively owned.
pub struct SessionGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Release our clone of the mutex first, then drop the entry only if
        // nobody else is holding or waiting on it.
        self.guard.take();
        self.locks.remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let locks = SessionLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("s-1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_different_sessions_do_not_block() {
        let locks = SessionLocks::new();
        let a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(a.session_id(), "a");
        assert_eq!(locks.active(), 2);
        drop(b);
        drop(a);
        assert_eq!(locks.active(), 0);
    }
}
