//! Control surface tying both tracks together.
//!
//! [`AgentCore`] owns the shared services (lock, registry, experts, chat
//! client, session store) and exposes the operations a front end needs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{ChatClient, ExpertRegistry, OpenAiCompatClient, SubprocessExpert};
use crate::config::ResolvedConfig;
use crate::domain::{Asset, AssetKind, AssetStatus, ReasoningTurn, TurnEvent};

use super::ingestion::{BatchReport, IngestError, IngestionOrchestrator};
use super::lock::{LockSnapshot, ResourceLock, Track};
use super::reasoner::{ReasonerSettings, ReflectiveReasoner};
use super::registry::{AssetRegistry, RegisterOutcome, RegistryError, RegistrySummary};
use super::sessions::{SessionError, SessionStore};

/// Task id recorded when a query lock is taken by hand
const MANUAL_QUERY_TASK: &str = "manual-query";

/// Combined lock and registry state
#[derive(Debug, Clone, Serialize)]
pub struct FullState {
    pub lock: LockSnapshot,
    pub registry: RegistrySummary,
}

/// Build subprocess experts for every configured kind
pub fn experts_from_config(config: &ResolvedConfig) -> ExpertRegistry {
    let mut experts = ExpertRegistry::new();
    for (kind, cfg) in &config.experts {
        let mut expert = SubprocessExpert::new(kind.as_str(), cfg.program.clone(), cfg.timeout)
            .with_args(cfg.args.clone())
            .with_env(cfg.env.clone());
        if let Some(ref dir) = cfg.working_dir {
            expert = expert.with_working_dir(dir.clone());
        }
        experts.register(*kind, Arc::new(expert));
    }
    experts
}

pub struct AgentCore {
    lock: Arc<ResourceLock>,
    registry: Arc<AssetRegistry>,
    ingestion: Arc<IngestionOrchestrator>,
    reasoner: Arc<ReflectiveReasoner>,
}

impl AgentCore {
    pub fn new(
        registry: Arc<AssetRegistry>,
        experts: Arc<ExpertRegistry>,
        chat: Arc<dyn ChatClient>,
        sessions: SessionStore,
        settings: ReasonerSettings,
    ) -> Self {
        let lock = Arc::new(ResourceLock::new());
        let ingestion = Arc::new(IngestionOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&lock),
            Arc::clone(&experts),
        ));
        let reasoner = Arc::new(ReflectiveReasoner::new(
            Arc::clone(&lock),
            experts,
            chat,
            sessions,
            settings,
        ));

        Self {
            lock,
            registry,
            ingestion,
            reasoner,
        }
    }

    /// Wire up every service from resolved configuration
    pub async fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let registry = AssetRegistry::open(config.registry_dir(), config.recovery)
            .await
            .with_context(|| format!("Failed to open registry: {}", config.registry_dir().display()))?;
        let sessions = SessionStore::open(config.sessions_dir())
            .await
            .with_context(|| format!("Failed to open sessions: {}", config.sessions_dir().display()))?;

        let api_key = config.llm.api_key().unwrap_or_else(|| {
            warn!(env = %config.llm.api_key_env, "No chat API key set; LLM calls will be rejected");
            String::new()
        });
        let chat = OpenAiCompatClient::new(
            config.llm.base_url.clone(),
            config.llm.model.clone(),
            api_key,
            Duration::from_secs(config.llm.timeout_seconds),
        )
        .context("Failed to build chat client")?;

        let experts = experts_from_config(config);
        info!(experts = ?experts.kinds(), home = %config.home.display(), "Agent core ready");

        Ok(Self::new(
            Arc::new(registry),
            Arc::new(experts),
            Arc::new(chat),
            sessions,
            config.reasoner_settings(),
        ))
    }

    pub fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }

    pub fn registry(&self) -> &Arc<AssetRegistry> {
        &self.registry
    }

    pub fn acquire_ingestion_lock(&self, task_id: &str) -> bool {
        self.lock.try_acquire(Track::Ingest, task_id)
    }

    pub fn acquire_query_lock(&self) -> bool {
        self.lock.try_acquire(Track::Query, MANUAL_QUERY_TASK)
    }

    pub fn release_lock(&self) {
        self.lock.release();
    }

    pub async fn get_full_state(&self) -> FullState {
        FullState {
            lock: self.lock.snapshot(),
            registry: self.registry.summary().await,
        }
    }

    pub async fn register(
        &self,
        id: &str,
        kind: AssetKind,
        location: impl Into<PathBuf>,
    ) -> Result<RegisterOutcome, RegistryError> {
        self.registry.register(id, kind, location).await
    }

    pub async fn mark_raw(&self, id: &str) -> Result<bool, RegistryError> {
        self.registry.mark_raw(id).await
    }

    pub async fn get_status(&self, id: &str) -> Option<AssetStatus> {
        self.registry.get(id).await.map(|a| a.status)
    }

    pub async fn assets(&self) -> Vec<Asset> {
        self.registry.list().await
    }

    /// Answer a question; see [`ReflectiveReasoner::run_turn`]
    pub fn run_turn(&self, question: String, turn_id: Option<String>) -> mpsc::Receiver<TurnEvent> {
        self.reasoner.run_turn(question, turn_id)
    }

    /// Drain the ingestion queue and wait for the report
    pub async fn run_ingestion(&self, task_id: &str) -> Result<BatchReport, IngestError> {
        self.ingestion.run_batch(task_id).await
    }

    /// Take the ingest lock now and drain the queue in the background
    pub fn start_ingestion(
        &self,
        task_id: &str,
    ) -> Result<JoinHandle<Result<BatchReport, IngestError>>, IngestError> {
        self.ingestion.spawn_batch(task_id)
    }

    pub async fn sessions(&self) -> Result<Vec<ReasoningTurn>, SessionError> {
        self.reasoner.sessions().list().await
    }

    pub async fn session(&self, turn_id: &str) -> Result<Option<ReasoningTurn>, SessionError> {
        self.reasoner.sessions().load(turn_id).await
    }
}
