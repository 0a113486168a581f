//! Durable asset registry.
//!
//! Follows the event-store pattern: an append-only JSONL log of
//! [`AssetEvent`]s, with the current state of every asset derived by replay.
//! Each transition is written and synced before the call returns, so a
//! restarted process knows exactly which steps finished.

use std::collections::{HashMap, VecDeque};
use std::fs::File as StdFile;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{Asset, AssetEvent, AssetEventKind, AssetKind, AssetStatus};

const LOG_FILE: &str = "assets.jsonl";
const LOCK_FILE: &str = "registry.lock";

/// Errors that can occur with the asset registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Asset not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for asset {id}: {from} → {to}")]
    InvalidTransition {
        id: String,
        from: AssetStatus,
        to: AssetStatus,
    },

    #[error("Registry at {0} is owned by another process")]
    Locked(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What to do with assets found mid-pipeline after a restart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Re-enqueue; the interrupted step runs again
    #[default]
    Resume,

    /// Mark them `Failed`
    Fail,
}

/// Result of registering an asset
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    Registered(Asset),

    /// Id already known; nothing changed
    Duplicate(Asset),
}

impl RegisterOutcome {
    pub fn asset(&self) -> &Asset {
        match self {
            Self::Registered(asset) | Self::Duplicate(asset) => asset,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Registered(_))
    }
}

/// Overall registry activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GlobalState {
    Waiting,
    Handling,
    Uploading,
}

/// Registry status summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySummary {
    pub global_state: GlobalState,
    pub assets_number: usize,
    pub queue_length: usize,
    pub current_processing: Option<String>,
    pub counts: HashMap<AssetStatus, usize>,
}

#[derive(Debug, Default)]
struct RegistryState {
    assets: HashMap<String, Asset>,

    /// Registration order
    order: Vec<String>,

    /// FIFO of ids waiting for the pipeline
    pending: VecDeque<String>,

    current: Option<String>,
}

impl RegistryState {
    fn apply(&mut self, event: AssetEvent) {
        match event.kind {
            AssetEventKind::Registered { asset } => {
                if !self.assets.contains_key(&asset.id) {
                    self.order.push(asset.id.clone());
                    self.assets.insert(asset.id.clone(), asset);
                }
            }
            AssetEventKind::Advanced {
                status,
                processed_location,
            } => {
                if let Some(asset) = self.assets.get_mut(&event.asset_id) {
                    asset.status = status;
                    if processed_location.is_some() {
                        asset.processed_location = processed_location;
                    }
                    asset.updated_at = event.timestamp;
                }
            }
            AssetEventKind::Requeued => {
                if let Some(asset) = self.assets.get_mut(&event.asset_id) {
                    asset.retry_count += 1;
                    asset.updated_at = event.timestamp;
                }
            }
            AssetEventKind::Failed { reason } => {
                if let Some(asset) = self.assets.get_mut(&event.asset_id) {
                    asset.status = AssetStatus::Failed;
                    asset.failure_reason = Some(reason);
                    asset.updated_at = event.timestamp;
                }
            }
        }
    }

    fn enqueue(&mut self, id: &str) {
        if !self.pending.iter().any(|p| p == id) {
            self.pending.push_back(id.to_string());
        }
    }

    fn get(&self, id: &str) -> Result<&Asset, RegistryError> {
        self.assets
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// Owner of every asset record
pub struct AssetRegistry {
    dir: PathBuf,
    log_path: PathBuf,
    state: Mutex<RegistryState>,

    /// Held for the registry's lifetime; the OS drops the lock on close
    _lock_file: StdFile,
}

impl AssetRegistry {
    /// Open (or create) the registry in `dir`, replay its log, and re-enqueue
    /// unfinished assets according to `recovery`
    pub async fn open(dir: impl AsRef<Path>, recovery: RecoveryPolicy) -> Result<Self, RegistryError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = StdFile::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| RegistryError::Locked(dir.clone()))?;

        let registry = Self {
            log_path: dir.join(LOG_FILE),
            dir,
            state: Mutex::new(RegistryState::default()),
            _lock_file: lock_file,
        };
        registry.replay().await?;
        registry.recover(recovery).await?;
        Ok(registry)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn replay(&self) -> Result<(), RegistryError> {
        if !self.log_path.exists() {
            return Ok(());
        }

        let file = File::open(&self.log_path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut state = self.state.lock().await;
        let mut replayed = 0usize;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AssetEvent>(&line) {
                Ok(event) => {
                    state.apply(event);
                    replayed += 1;
                }
                // A crash mid-append can leave a torn final line
                Err(e) => warn!(error = %e, "Skipping unreadable registry entry"),
            }
        }

        debug!(events = replayed, assets = state.assets.len(), "Registry replayed");
        Ok(())
    }

    async fn recover(&self, recovery: RecoveryPolicy) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let ids = state.order.clone();

        for id in ids {
            let status = state.get(&id)?.status;
            if status == AssetStatus::Raw {
                state.enqueue(&id);
                continue;
            }
            if !status.is_in_pipeline() {
                continue;
            }

            let kind = match recovery {
                RecoveryPolicy::Resume => AssetEventKind::Requeued,
                RecoveryPolicy::Fail => AssetEventKind::Failed {
                    reason: format!("Interrupted after {}", status),
                },
            };
            let event = AssetEvent::new(&id, kind);
            self.append(&event).await?;
            state.apply(event);

            if recovery == RecoveryPolicy::Resume {
                info!(asset_id = %id, %status, "Re-queued interrupted asset");
                state.enqueue(&id);
            } else {
                warn!(asset_id = %id, %status, "Failed interrupted asset");
            }
        }

        Ok(())
    }

    /// Append one event and force it to disk
    async fn append(&self, event: &AssetEvent) -> Result<(), RegistryError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    /// Create an asset in `Uploading`. A duplicate id is a no-op.
    pub async fn register(
        &self,
        id: &str,
        kind: AssetKind,
        raw_location: impl Into<PathBuf>,
    ) -> Result<RegisterOutcome, RegistryError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.assets.get(id) {
            warn!(asset_id = %id, status = %existing.status, "Asset already registered");
            return Ok(RegisterOutcome::Duplicate(existing.clone()));
        }

        let asset = Asset::new(id, kind, raw_location);
        let event = AssetEvent::new(
            id,
            AssetEventKind::Registered {
                asset: asset.clone(),
            },
        );
        self.append(&event).await?;
        state.apply(event);

        info!(asset_id = %id, %kind, "Asset registered");
        Ok(RegisterOutcome::Registered(asset))
    }

    /// `Uploading → Raw` and enqueue. Returns false if the asset was not
    /// `Uploading` (nothing changes).
    pub async fn mark_raw(&self, id: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        let status = state.get(id)?.status;
        if status != AssetStatus::Uploading {
            warn!(asset_id = %id, %status, "mark_raw ignored: asset is not uploading");
            return Ok(false);
        }

        let event = AssetEvent::new(
            id,
            AssetEventKind::Advanced {
                status: AssetStatus::Raw,
                processed_location: None,
            },
        );
        self.append(&event).await?;
        state.apply(event);
        state.enqueue(id);

        info!(asset_id = %id, "Asset ready for pipeline");
        Ok(true)
    }

    /// Move an asset to its immediate successor status
    pub async fn advance(
        &self,
        id: &str,
        next: AssetStatus,
        processed_location: Option<PathBuf>,
    ) -> Result<Asset, RegistryError> {
        let mut state = self.state.lock().await;
        let from = state.get(id)?.status;
        if from.next() != Some(next) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from,
                to: next,
            });
        }

        let event = AssetEvent::new(
            id,
            AssetEventKind::Advanced {
                status: next,
                processed_location,
            },
        );
        self.append(&event).await?;
        state.apply(event);
        if next == AssetStatus::Raw {
            state.enqueue(id);
        }

        debug!(asset_id = %id, %from, to = %next, "Asset advanced");
        state.get(id).cloned()
    }

    /// Mark an asset terminally failed
    pub async fn fail(&self, id: &str, reason: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let from = state.get(id)?.status;
        if !from.can_transition_to(AssetStatus::Failed) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from,
                to: AssetStatus::Failed,
            });
        }

        let event = AssetEvent::new(
            id,
            AssetEventKind::Failed {
                reason: reason.to_string(),
            },
        );
        self.append(&event).await?;
        state.apply(event);
        state.pending.retain(|p| p != id);

        warn!(asset_id = %id, %from, reason, "Asset failed");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Asset> {
        self.state.lock().await.assets.get(id).cloned()
    }

    /// All assets in registration order
    pub async fn list(&self) -> Vec<Asset> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.assets.get(id).cloned())
            .collect()
    }

    /// Pop the next queued id that still has pipeline work
    pub async fn next_pending(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.pending.pop_front() {
            let live = state
                .assets
                .get(&id)
                .map(|a| a.status.is_in_pipeline())
                .unwrap_or(false);
            if live {
                return Some(id);
            }
        }
        None
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn set_current(&self, id: Option<&str>) {
        self.state.lock().await.current = id.map(str::to_string);
    }

    pub async fn summary(&self) -> RegistrySummary {
        let state = self.state.lock().await;

        let mut counts: HashMap<AssetStatus, usize> = HashMap::new();
        for asset in state.assets.values() {
            *counts.entry(asset.status).or_default() += 1;
        }

        let global_state = if state.current.is_some() {
            GlobalState::Handling
        } else if counts.contains_key(&AssetStatus::Uploading) {
            GlobalState::Uploading
        } else {
            GlobalState::Waiting
        };

        RegistrySummary {
            global_state,
            assets_number: state.assets.len(),
            queue_length: state.pending.len(),
            current_processing: state.current.clone(),
            counts,
        }
    }
}
