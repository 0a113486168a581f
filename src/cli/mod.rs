//! Command-line interface for acadagent.
//!
//! Provides commands for registering uploads, running the ingestion
//! pipeline, asking questions, and inspecting assets, sessions and state.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::core::{AgentCore, IngestError};
use crate::domain::{AssetKind, TurnEvent};

/// acadagent - Dual-track orchestrator for ingestion and reflective Q&A
#[derive(Parser, Debug)]
#[command(name = "acadagent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose logging (debug level) unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register an uploaded file and queue it for ingestion
    Register {
        /// File whose bytes are already on disk
        path: PathBuf,

        /// Asset ID (defaults to a content hash)
        #[arg(long)]
        id: Option<String>,

        /// Asset kind (detected from the extension if not specified)
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,

        /// Register only; leave the asset in `uploading`
        #[arg(long)]
        no_queue: bool,
    },

    /// Mark an uploading asset as durable and queue it
    MarkRaw {
        /// Asset ID
        id: String,
    },

    /// Show the status of one asset
    Status {
        /// Asset ID
        id: String,
    },

    /// List registered assets
    Assets,

    /// Process every queued asset
    Ingest {
        /// Task ID recorded on the lock
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Ask a question
    Ask {
        /// The question
        question: String,

        /// Continue an existing session
        #[arg(short, long)]
        turn: Option<String>,

        /// Print raw JSON events instead of formatted output
        #[arg(long)]
        json: bool,
    },

    /// Show lock and registry state
    State,

    /// List sessions, or show one
    Sessions {
        /// Session to show in full
        turn_id: Option<String>,

        /// Maximum number of sessions to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Asset kind for CLI (maps to AssetKind)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    /// PDF document
    Pdf,

    /// Video
    Video,
}

impl From<KindArg> for AssetKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Pdf => AssetKind::Document,
            KindArg::Video => AssetKind::Video,
        }
    }
}

impl Cli {
    /// Default log filter for this invocation
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug,hyper=info,reqwest=info"
        } else {
            "info,hyper=warn,reqwest=warn"
        }
    }

    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::config()?;

        match self.command {
            Commands::Register {
                path,
                id,
                kind,
                no_queue,
            } => register(config, &path, id, kind, no_queue).await,
            Commands::MarkRaw { id } => {
                let core = AgentCore::from_config(config).await?;
                if core.mark_raw(&id).await? {
                    eprintln!("Queued {}", id);
                } else {
                    eprintln!("{} is not uploading; nothing changed", id);
                }
                Ok(())
            }
            Commands::Status { id } => show_status(config, &id).await,
            Commands::Assets => list_assets(config).await,
            Commands::Ingest { task_id } => run_ingestion(config, task_id).await,
            Commands::Ask {
                question,
                turn,
                json,
            } => ask(config, question, turn, json).await,
            Commands::State => {
                let core = AgentCore::from_config(config).await?;
                let state = core.get_full_state().await;
                println!("{}", serde_json::to_string_pretty(&state)?);
                Ok(())
            }
            Commands::Sessions { turn_id, limit } => show_sessions(config, turn_id, limit).await,
            Commands::Config => show_config(config),
        }
    }
}

/// SHA256 of file content, first 12 hex characters
pub async fn compute_file_hash(path: &Path) -> Result<String> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let digest = Sha256::digest(&content);
    Ok(hex::encode(digest)[..12].to_string())
}

async fn register(
    config: &ResolvedConfig,
    path: &Path,
    id: Option<String>,
    kind: Option<KindArg>,
    no_queue: bool,
) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("File not found: {}", path.display()))?;

    let kind = match kind {
        Some(kind) => kind.into(),
        None => path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(AssetKind::from_extension)
            .with_context(|| format!("Cannot detect asset kind of {}; pass --kind", path.display()))?,
    };

    let id = match id {
        Some(id) => id,
        None => compute_file_hash(&path).await?,
    };

    let core = AgentCore::from_config(config).await?;
    let outcome = core.register(&id, kind, path.clone()).await?;
    if !outcome.is_new() {
        eprintln!("Already registered: {} ({})", id, outcome.asset().status);
        return Ok(());
    }

    if !no_queue {
        core.mark_raw(&id).await?;
    }
    println!("{}", id);
    eprintln!("Registered {} {} from {}", kind, id, path.display());
    Ok(())
}

async fn show_status(config: &ResolvedConfig, id: &str) -> Result<()> {
    let core = AgentCore::from_config(config).await?;
    let asset = core
        .registry()
        .get(id)
        .await
        .with_context(|| format!("Asset not found: {}", id))?;

    println!("Asset ID: {}", asset.id);
    println!("Kind: {}", asset.kind);
    println!("Status: {}", asset.status);
    println!("Raw: {}", asset.raw_location.display());
    if let Some(ref processed) = asset.processed_location {
        println!("Processed: {}", processed.display());
    }
    println!("Retries: {}", asset.retry_count);
    println!("Created: {}", asset.created_at);
    println!("Updated: {}", asset.updated_at);
    if let Some(ref reason) = asset.failure_reason {
        println!("Failure: {}", reason);
    }
    Ok(())
}

async fn list_assets(config: &ResolvedConfig) -> Result<()> {
    let core = AgentCore::from_config(config).await?;
    let assets = core.assets().await;

    if assets.is_empty() {
        println!("No assets registered. Use 'acadagent register <file>' to add one.");
        return Ok(());
    }

    println!("{:<14} {:<10} {:<12} {:<40}", "ID", "KIND", "STATUS", "SOURCE");
    println!("{}", "-".repeat(80));
    for asset in &assets {
        let source = asset
            .raw_location
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        println!(
            "{:<14} {:<10} {:<12} {:<40}",
            asset.id,
            asset.kind.as_str(),
            asset.status.as_str(),
            source
        );
    }
    println!("\nTotal: {} assets", assets.len());
    Ok(())
}

async fn run_ingestion(config: &ResolvedConfig, task_id: Option<String>) -> Result<()> {
    let core = AgentCore::from_config(config).await?;
    let task_id = task_id.unwrap_or_else(|| format!("ingest-{}", Uuid::new_v4().simple()));

    let queued = core.registry().pending_ids().await.len();
    if queued == 0 {
        eprintln!("Nothing queued.");
        return Ok(());
    }
    eprintln!("Processing {} queued asset(s) as {}", queued, task_id);

    match core.run_ingestion(&task_id).await {
        Ok(report) => {
            for id in &report.ready {
                eprintln!("  ready   {}", id);
            }
            for (id, reason) in &report.failed {
                eprintln!("  failed  {}: {}", id, reason);
            }
            eprintln!(
                "\n[Batch {} finished: {} ready, {} failed]",
                report.task_id,
                report.ready.len(),
                report.failed.len()
            );
            Ok(())
        }
        Err(IngestError::LockDenied { .. }) => {
            anyhow::bail!("Accelerator busy; try again when the current task finishes")
        }
        Err(e) => Err(e.into()),
    }
}

async fn ask(config: &ResolvedConfig, question: String, turn: Option<String>, json: bool) -> Result<()> {
    let core = AgentCore::from_config(config).await?;
    let mut events = core.run_turn(question, turn);
    let mut stdout = std::io::stdout();
    let mut failed = None;

    while let Some(event) = events.recv().await {
        if json {
            println!("{}", event.to_json());
            if let TurnEvent::Error { content } = event {
                failed = Some(content);
            }
            continue;
        }

        match event {
            TurnEvent::NodeStart { message, .. } => eprintln!("» {}", message),
            TurnEvent::Token { content } => {
                print!("{}", content);
                stdout.flush()?;
            }
            TurnEvent::FinalResult { citations, .. } => {
                println!();
                if !citations.is_empty() {
                    eprintln!("\nSources:");
                    for (i, citation) in citations.iter().enumerate() {
                        eprintln!(
                            "  [{}] {} {}",
                            i + 1,
                            citation.source_asset_id,
                            citation.label.as_deref().unwrap_or("")
                        );
                    }
                }
            }
            TurnEvent::Error { content } => failed = Some(content),
        }
    }

    match failed {
        Some(reason) => anyhow::bail!("{}", reason),
        None => Ok(()),
    }
}

async fn show_sessions(config: &ResolvedConfig, turn_id: Option<String>, limit: usize) -> Result<()> {
    let core = AgentCore::from_config(config).await?;

    if let Some(turn_id) = turn_id {
        let turn = core
            .session(&turn_id)
            .await?
            .with_context(|| format!("Session not found: {}", turn_id))?;
        println!("{}", serde_json::to_string_pretty(&turn)?);
        return Ok(());
    }

    let sessions = core.sessions().await?;
    if sessions.is_empty() {
        println!("No sessions yet");
        return Ok(());
    }

    println!("{:<14} {:<12} {:<8} {:<30}", "TURN ID", "STATUS", "MSGS", "TITLE");
    println!("{}", "-".repeat(70));
    for turn in sessions.iter().take(limit) {
        println!(
            "{:<14} {:<12} {:<8} {:<30}",
            turn.turn_id,
            format!("{:?}", turn.status),
            turn.messages.len(),
            turn.title
        );
    }
    Ok(())
}

fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("acadagent configuration");
    println!();
    match config.config_file {
        Some(ref path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none, using defaults)"),
    }
    println!("Home:        {}", config.home.display());
    println!("Storage:     {}", config.storage.display());
    println!("Frames:      {}", config.frames_dir.display());
    println!("Recovery:    {:?}", config.recovery);
    println!();
    println!("LLM:         {} ({})", config.llm.model, config.llm.base_url);
    println!(
        "API key:     ${} {}",
        config.llm.api_key_env,
        if config.llm.api_key().is_some() { "(set)" } else { "(missing)" }
    );
    println!();
    println!(
        "Reasoning:   max_retries={} top_k={} history_window={}",
        config.reasoning.max_retries, config.reasoning.top_k, config.reasoning.history_window
    );
    println!();
    if config.experts.is_empty() {
        println!("Experts:     (none configured)");
    } else {
        println!("Experts:");
        let mut experts: Vec<_> = config.experts.iter().collect();
        experts.sort_by_key(|(kind, _)| kind.as_str());
        for (kind, expert) in experts {
            println!(
                "  {:<22} {} {} (timeout {:?})",
                kind.as_str(),
                expert.program.display(),
                expert.args.join(" "),
                expert.timeout
            );
        }
    }
    Ok(())
}
