//! Ingestion track: drives queued assets through the pipeline.
//!
//! One worker, one asset at a time, steps strictly in order. Each step calls
//! its expert and only advances the asset once the expert reports success.
//! A failing asset is marked `Failed` and the batch moves on.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::adapters::{ExpertError, ExpertKind, ExpertRegistry, ExpertRequest};
use crate::domain::{AssetKind, AssetStatus};

use super::lock::{LockGuard, ResourceLock, Track};
use super::registry::{AssetRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Accelerator busy; ingestion task {task_id} not started")]
    LockDenied { task_id: String },

    #[error("Asset {asset_id} failed reaching {target}: {source}")]
    Step {
        asset_id: String,
        target: AssetStatus,
        #[source]
        source: ExpertError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of one drained queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub task_id: String,
    pub ready: Vec<String>,

    /// `(asset id, reason)`
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.ready.len() + self.failed.len()
    }
}

/// Expert that produces `target`; `None` for the finalisation step
pub fn expert_for(target: AssetStatus, kind: AssetKind) -> Option<ExpertKind> {
    match target {
        AssetStatus::Recognizing => Some(match kind {
            AssetKind::Document => ExpertKind::DocumentRecognition,
            AssetKind::Video => ExpertKind::VideoRecognition,
        }),
        AssetStatus::Clipping => Some(ExpertKind::ClipIndexing),
        AssetStatus::Structuring => Some(ExpertKind::StructureGeneration),
        AssetStatus::Ingesting => Some(ExpertKind::VectorIngestion),
        _ => None,
    }
}

pub struct IngestionOrchestrator {
    registry: Arc<AssetRegistry>,
    lock: Arc<ResourceLock>,
    experts: Arc<ExpertRegistry>,
}

impl IngestionOrchestrator {
    pub fn new(registry: Arc<AssetRegistry>, lock: Arc<ResourceLock>, experts: Arc<ExpertRegistry>) -> Self {
        Self {
            registry,
            lock,
            experts,
        }
    }

    fn acquire(&self, task_id: &str) -> Result<LockGuard, IngestError> {
        self.lock
            .try_acquire_guard(Track::Ingest, task_id)
            .ok_or_else(|| IngestError::LockDenied {
                task_id: task_id.to_string(),
            })
    }

    /// Drain the queue under one ingest lock acquisition
    #[instrument(skip(self))]
    pub async fn run_batch(&self, task_id: &str) -> Result<BatchReport, IngestError> {
        let guard = self.acquire(task_id)?;
        self.drain(guard).await
    }

    /// Acquire the lock now, drain the queue on a background task
    pub fn spawn_batch(
        self: &Arc<Self>,
        task_id: &str,
    ) -> Result<JoinHandle<Result<BatchReport, IngestError>>, IngestError> {
        let guard = self.acquire(task_id)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.drain(guard).await }))
    }

    async fn drain(&self, guard: LockGuard) -> Result<BatchReport, IngestError> {
        let mut report = BatchReport {
            task_id: guard.task_id().to_string(),
            ..Default::default()
        };

        self.lock.reset_progress();
        self.lock.update_progress("pipeline", 0, Some("Initiating ingestion..."));
        self.lock.set_active_assets(self.registry.pending_ids().await);

        let result = self.drain_queue(&mut report).await;
        self.registry.set_current(None).await;

        match &result {
            Ok(()) => info!(
                ready = report.ready.len(),
                failed = report.failed.len(),
                "Ingestion batch complete"
            ),
            Err(e) => error!(error = %e, "Ingestion batch aborted"),
        }

        // Guard drops here and frees the accelerator on every path
        drop(guard);
        result.map(|()| report)
    }

    async fn drain_queue(&self, report: &mut BatchReport) -> Result<(), IngestError> {
        while let Some(id) = self.registry.next_pending().await {
            self.registry.set_current(Some(&id)).await;

            match self.process_asset(&id).await {
                Ok(()) => {
                    info!(asset_id = %id, "Asset ready");
                    report.ready.push(id);
                }
                Err(IngestError::Step {
                    asset_id,
                    target,
                    source,
                }) => {
                    let reason = format!("{} step failed: {}", target, source);
                    warn!(asset_id = %asset_id, %reason, "Asset failed, continuing with next");
                    self.registry.fail(&asset_id, &reason).await?;
                    report.failed.push((asset_id, reason));
                }
                Err(e) => return Err(e),
            }

            let remaining = self.registry.pending_ids().await;
            let done = report.processed();
            let percent = (done * 100 / (done + remaining.len()).max(1)) as u8;
            self.lock.update_progress(
                "pipeline",
                percent,
                Some(&format!("Processed {} asset(s), {} queued", done, remaining.len())),
            );
            self.lock.set_active_assets(remaining);
        }
        Ok(())
    }

    /// Run every remaining step of one asset
    async fn process_asset(&self, id: &str) -> Result<(), IngestError> {
        let mut asset = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        while let Some(target) = asset.status.next() {
            self.lock.update_progress(
                target.as_str(),
                0,
                Some(&format!("{} {}: {}", asset.kind, id, target)),
            );

            let processed_location = match expert_for(target, asset.kind) {
                Some(kind) => {
                    let request = ExpertRequest::for_asset(&asset).with("step", target.as_str());
                    let response = self
                        .experts
                        .invoke(kind, request)
                        .await
                        .map_err(|source| IngestError::Step {
                            asset_id: id.to_string(),
                            target,
                            source,
                        })?;
                    response.processed_location
                }
                None => None,
            };

            asset = self.registry.advance(id, target, processed_location).await?;
            self.lock.update_progress(target.as_str(), 100, None);
        }

        Ok(())
    }
}
