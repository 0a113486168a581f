//! Single-owner accelerator lock.
//!
//! Ingestion and querying both need the accelerator, so at most one track
//! may own it at a time. Acquisition is a non-blocking check-and-set: a
//! caller that loses simply reports "busy". There is no queueing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

const READY_MESSAGE: &str = "System Ready";

/// Workload competing for the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Ingest,
    Query,
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => f.write_str("ingest"),
            Self::Query => f.write_str("query"),
        }
    }
}

/// Coarse state reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockStatus {
    Idle,
    Ingesting,
    Querying,
}

/// Point-in-time copy of the lock state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockSnapshot {
    pub status: LockStatus,
    pub owner: Option<Track>,
    pub task_id: Option<String>,
    pub progress: HashMap<String, u8>,
    pub active_assets: Vec<String>,
    pub message: String,
}

#[derive(Debug)]
struct LockState {
    owner: Option<Track>,
    task_id: Option<String>,
    progress: HashMap<String, u8>,
    active_assets: Vec<String>,
    message: String,
}

impl Default for LockState {
    fn default() -> Self {
        Self {
            owner: None,
            task_id: None,
            progress: HashMap::new(),
            active_assets: Vec::new(),
            message: READY_MESSAGE.to_string(),
        }
    }
}

/// Process-wide mutual exclusion between ingestion and querying
#[derive(Debug, Default)]
pub struct ResourceLock {
    state: Mutex<LockState>,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // A panic while holding the mutex cannot leave the state half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership if nobody holds the lock. Never blocks.
    pub fn try_acquire(&self, track: Track, task_id: &str) -> bool {
        let mut state = self.state();
        if let Some(owner) = state.owner {
            debug!(%track, %owner, "Lock denied");
            return false;
        }

        state.owner = Some(track);
        state.task_id = Some(task_id.to_string());
        state.message = match track {
            Track::Ingest => format!("Ingesting ({})", task_id),
            Track::Query => format!("Answering ({})", task_id),
        };
        info!(%track, task_id, "Lock acquired");
        true
    }

    /// Like [`try_acquire`](Self::try_acquire), but returns a guard that
    /// releases the lock when dropped
    pub fn try_acquire_guard(self: &Arc<Self>, track: Track, task_id: &str) -> Option<LockGuard> {
        self.try_acquire(track, task_id).then(|| LockGuard {
            lock: Arc::clone(self),
            task_id: task_id.to_string(),
        })
    }

    /// Reset to unowned. Safe to call when nobody owns the lock.
    pub fn release(&self) {
        let mut state = self.state();
        if let Some(owner) = state.owner {
            info!(%owner, task_id = ?state.task_id, "Lock released");
        }
        *state = LockState::default();
    }

    /// Release only if `task_id` is still the owner
    fn release_if_owner(&self, task_id: &str) {
        let mut state = self.state();
        if state.task_id.as_deref() == Some(task_id) {
            info!(task_id, "Lock released by guard");
            *state = LockState::default();
        } else if state.owner.is_some() {
            warn!(task_id, owner = ?state.task_id, "Stale guard dropped; lock left untouched");
        }
    }

    pub fn is_query_allowed(&self) -> bool {
        self.state().owner.is_none()
    }

    pub fn owner(&self) -> Option<Track> {
        self.state().owner
    }

    /// Record progress of one component; percent is clamped to 100
    pub fn update_progress(&self, component: &str, percent: u8, message: Option<&str>) {
        let mut state = self.state();
        state.progress.insert(component.to_string(), percent.min(100));
        if let Some(message) = message {
            state.message = message.to_string();
        }
    }

    pub fn set_active_assets(&self, ids: Vec<String>) {
        self.state().active_assets = ids;
    }

    pub fn reset_progress(&self) {
        self.state().progress.clear();
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state();
        let status = match state.owner {
            None => LockStatus::Idle,
            Some(Track::Ingest) => LockStatus::Ingesting,
            Some(Track::Query) => LockStatus::Querying,
        };
        LockSnapshot {
            status,
            owner: state.owner,
            task_id: state.task_id.clone(),
            progress: state.progress.clone(),
            active_assets: state.active_assets.clone(),
            message: state.message.clone(),
        }
    }
}

/// Ownership token; releases the lock on drop, including on panic and task
/// cancellation
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<ResourceLock>,
    task_id: String,
}

impl LockGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn lock(&self) -> &ResourceLock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release_if_owner(&self.task_id);
    }
}
