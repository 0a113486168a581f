//! Domain types for the orchestrator.
//!
//! This module contains the core data structures:
//! - Asset: uploaded documents/videos and their pipeline status
//! - Evidence: retrieved fragments and ranked candidates
//! - Turn: reasoning sessions
//! - Events: registry log records and streamed turn events

pub mod asset;
pub mod events;
pub mod evidence;
pub mod turn;

// Re-export commonly used types
pub use asset::{Asset, AssetKind, AssetStatus, UnknownStatus};
pub use events::{AssetEvent, AssetEventKind, Node, TurnEvent};
pub use evidence::{Citation, Evidence, Locator, Modality, ScoredCandidate};
pub use turn::{ChatMessage, Manifest, ReasoningTurn, Role, TurnStatus};
