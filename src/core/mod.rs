//! Core orchestration logic.
//!
//! This module contains:
//! - ResourceLock: single-owner accelerator lock
//! - AssetRegistry: durable per-asset state machine
//! - IngestionOrchestrator: drives queued assets through the pipeline
//! - RankingEngine: multi-factor candidate ranking
//! - ReflectiveReasoner: bounded research/evaluate/synthesize loop
//! - AgentCore: control surface over both tracks

pub mod ingestion;
pub mod lock;
pub mod orchestrator;
pub mod prompts;
pub mod ranking;
pub mod reasoner;
pub mod registry;
pub mod sessions;

// Re-export commonly used types
pub use ingestion::{expert_for, BatchReport, IngestError, IngestionOrchestrator};
pub use lock::{LockGuard, LockSnapshot, LockStatus, ResourceLock, Track};
pub use orchestrator::{experts_from_config, AgentCore, FullState};
pub use ranking::{pool_size, Preferences, RankingEngine, RankingWeights, OVERFETCH_FACTOR};
pub use reasoner::{
    decide, EvalAction, EvalReport, ReasonerSettings, ReflectiveReasoner, TurnError, MAX_RETRIES,
};
pub use registry::{
    AssetRegistry, GlobalState, RecoveryPolicy, RegisterOutcome, RegistryError, RegistrySummary,
};
pub use sessions::{SessionError, SessionStore};
