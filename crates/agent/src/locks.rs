//! Per-session run locks.
//!
//! A run holds its session's lock from start to finish, so two runs on the
//! same session never interleave. Runs on different sessions proceed freely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
pub struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `session_id`, created on first use.
    pub fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Wait for and hold the run lock of `session_id`.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(session_id).lock_owned().await
    }

    /// Wait until no run holds `session_id`'s lock, without keeping it.
    pub async fn wait_idle(&self, session_id: &str) {
        drop(self.acquire(session_id).await);
    }

    /// Whether a run currently holds `session_id`'s lock.
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.lock_for(session_id).try_lock().is_err()
    }
}
