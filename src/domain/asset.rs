//! Assets and their pipeline state machine.
//!
//! An asset is an uploaded document or video. Its status only moves forward
//! along [`AssetStatus::PIPELINE`] or sideways into [`AssetStatus::Failed`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of uploaded asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Paged document (PDF)
    #[serde(alias = "pdf")]
    Document,

    /// Video with an audio track
    Video,
}

impl AssetKind {
    /// Guess the kind from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Document),
            "mp4" | "mkv" | "mov" | "webm" | "avi" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline status of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Registered, bytes still being written
    Uploading,

    /// Bytes durable, waiting in the pipeline queue
    Raw,

    /// Recognition (document parse or video transcription) done
    Recognizing,

    /// Clip features extracted
    Clipping,

    /// Structured outline generated
    Structuring,

    /// Vectors written to the similarity index
    Ingesting,

    /// Fully processed
    Ready,

    /// Terminal failure
    Failed,
}

/// Error decoding a status string
#[derive(Debug, Clone, Error)]
#[error("Unknown asset status: {0}")]
pub struct UnknownStatus(pub String);

impl AssetStatus {
    /// The forward sequence every asset follows
    pub const PIPELINE: [AssetStatus; 7] = [
        AssetStatus::Uploading,
        AssetStatus::Raw,
        AssetStatus::Recognizing,
        AssetStatus::Clipping,
        AssetStatus::Structuring,
        AssetStatus::Ingesting,
        AssetStatus::Ready,
    ];

    /// Position in the pipeline; `None` for `Failed`
    pub fn rank(self) -> Option<usize> {
        Self::PIPELINE.iter().position(|s| *s == self)
    }

    /// The immediate successor, if any
    pub fn next(self) -> Option<Self> {
        let rank = self.rank()?;
        Self::PIPELINE.get(rank + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Whether an asset in this status is past upload and still has work left
    pub fn is_in_pipeline(self) -> bool {
        matches!(
            self,
            Self::Raw | Self::Recognizing | Self::Clipping | Self::Structuring | Self::Ingesting
        )
    }

    /// Forward by exactly one step, or sideways into `Failed` from any non-terminal state
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Raw => "raw",
            Self::Recognizing => "recognizing",
            Self::Clipping => "clipping",
            Self::Structuring => "structuring",
            Self::Ingesting => "ingesting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::PIPELINE
            .iter()
            .chain(std::iter::once(&Self::Failed))
            .find(|status| status.as_str() == lower)
            .copied()
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Durable record of one uploaded asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Unique asset identifier
    pub id: String,

    pub kind: AssetKind,

    pub status: AssetStatus,

    /// Where the uploaded bytes live
    pub raw_location: PathBuf,

    /// Output location reported by the last expert that produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_location: Option<PathBuf>,

    /// Number of times the asset was re-queued after a crash
    #[serde(default)]
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Reason recorded when the asset failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Asset {
    /// Create a new asset in `Uploading`
    pub fn new(id: impl Into<String>, kind: AssetKind, raw_location: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: AssetStatus::Uploading,
            raw_location: raw_location.into(),
            processed_location: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }
}
