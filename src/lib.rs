//! acadagent - Dual-track orchestrator for an academic study assistant
//!
//! Two workloads share one accelerator:
//! - Track A (ingestion): uploaded documents and videos move through a
//!   recognition → clipping → structuring → vector ingestion pipeline
//! - Track B (query): questions are answered by a reflective
//!   retrieval-augmented reasoning loop
//!
//! # Architecture
//!
//! - A single-owner `ResourceLock` keeps the tracks mutually exclusive
//! - Asset state is an append-only event log; restarts replay it and
//!   re-queue unfinished work
//! - Specialists run out of process behind the `Expert` trait
//!
//! # Modules
//!
//! - `adapters`: Expert contract, subprocess dispatch, chat-completion client
//! - `core`: Lock, registry, ingestion, ranking, reasoning loop
//! - `domain`: Data structures (Asset, Evidence, ReasoningTurn, events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register an upload and queue it
//! acadagent register lecture01.mp4
//!
//! # Process everything queued
//! acadagent ingest
//!
//! # Ask a question
//! acadagent ask "What does slide 5 say about attention?"
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Expert, ExpertError, ExpertKind, ExpertRegistry, ExpertRequest, ExpertResponse};
pub use core::{AgentCore, AssetRegistry, IngestionOrchestrator, RankingEngine, ReflectiveReasoner, ResourceLock};
pub use domain::{Asset, AssetKind, AssetStatus, Evidence, ReasoningTurn, TurnEvent};
