//! Durable turn snapshots, one JSON file per turn id.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::domain::{ReasoningTurn, TurnStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid turn id: {0:?}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to persist snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Snapshot writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Directory of turn snapshots
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open the store and reset sessions left mid-question by a previous process
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let store = Self { dir: dir.into() };
        fs::create_dir_all(&store.dir).await?;
        store.recover().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, turn_id: &str) -> Result<PathBuf, SessionError> {
        let valid = !turn_id.is_empty()
            && turn_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::InvalidId(turn_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", turn_id)))
    }

    /// Write a snapshot atomically
    pub async fn save(&self, turn: &ReasoningTurn) -> Result<(), SessionError> {
        let path = self.path_for(&turn.turn_id)?;
        let json = serde_json::to_vec_pretty(turn)?;
        let dir = self.dir.clone();

        // Temp file + fsync + rename stays off the async workers
        tokio::task::spawn_blocking(move || -> Result<(), SessionError> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_data()?;
            tmp.persist(&path)?;
            Ok(())
        })
        .await??;

        debug!(turn_id = %turn.turn_id, status = ?turn.status, "Session saved");
        Ok(())
    }

    pub async fn load(&self, turn_id: &str) -> Result<Option<ReasoningTurn>, SessionError> {
        let path = self.path_for(turn_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Existing session or a fresh one
    pub async fn load_or_new(&self, turn_id: &str) -> Result<ReasoningTurn, SessionError> {
        Ok(self
            .load(turn_id)
            .await?
            .unwrap_or_else(|| ReasoningTurn::new(turn_id)))
    }

    /// All readable sessions, most recently updated first
    pub async fn list(&self) -> Result<Vec<ReasoningTurn>, SessionError> {
        let mut turns = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<ReasoningTurn>(&bytes).map_err(SessionError::from),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session"),
            }
        }

        turns.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(turns)
    }

    async fn recover(&self) -> Result<(), SessionError> {
        for mut turn in self.list().await? {
            if turn.status.is_active() {
                info!(turn_id = %turn.turn_id, status = ?turn.status, "Resetting interrupted session");
                turn.set_status(TurnStatus::Idle);
                self.save(&turn).await?;
            }
        }
        Ok(())
    }
}
