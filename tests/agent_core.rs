//! Control surface tests: both tracks sharing one accelerator

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use acadagent::adapters::{ExpertKind, ExpertRegistry};
use acadagent::core::{
    AgentCore, AssetRegistry, GlobalState, IngestError, LockStatus, ReasonerSettings,
    RecoveryPolicy, SessionStore,
};
use acadagent::domain::{AssetKind, AssetStatus, TurnEvent};

use common::{collect, document, search_returning, wait_released, FnExpert, ScriptedChat};

async fn build_core(temp: &TempDir) -> AgentCore {
    let registry = AssetRegistry::open(temp.path().join("registry"), RecoveryPolicy::Resume)
        .await
        .unwrap();
    let experts = ExpertRegistry::new()
        .with(ExpertKind::DocumentRecognition, FnExpert::ok("document"))
        .with(ExpertKind::ClipIndexing, FnExpert::ok("clip"))
        .with(ExpertKind::StructureGeneration, FnExpert::ok("structure"))
        .with(ExpertKind::VectorIngestion, FnExpert::ok("vectors"))
        .with(ExpertKind::Search, search_returning(vec![document("doc1", 2, 0.5)]));
    let sessions = SessionStore::open(temp.path().join("sessions"))
        .await
        .unwrap();

    AgentCore::new(
        Arc::new(registry),
        Arc::new(experts),
        Arc::new(ScriptedChat::new()),
        sessions,
        ReasonerSettings::default(),
    )
}

#[tokio::test]
async fn test_upload_ingest_then_ask() {
    let temp = TempDir::new().unwrap();
    let core = build_core(&temp).await;

    core.register("doc1", AssetKind::Document, "/raw/doc1.pdf").await.unwrap();
    assert_eq!(core.get_status("doc1").await, Some(AssetStatus::Uploading));
    assert!(core.mark_raw("doc1").await.unwrap());

    let report = core.run_ingestion("batch-1").await.unwrap();
    assert_eq!(report.ready, vec!["doc1".to_string()]);
    assert_eq!(core.get_status("doc1").await, Some(AssetStatus::Ready));

    let events = collect(core.run_turn("What is on page 2?".to_string(), Some("CH-1".to_string()))).await;
    assert!(matches!(events.last(), Some(TurnEvent::FinalResult { .. })));
    wait_released(core.lock()).await;

    let sessions = core.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(core.session("CH-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_manual_locks_exclude_each_other() {
    let temp = TempDir::new().unwrap();
    let core = build_core(&temp).await;

    assert!(core.acquire_ingestion_lock("manual-batch"));
    assert!(!core.acquire_query_lock());
    assert!(matches!(
        core.run_ingestion("batch-2").await,
        Err(IngestError::LockDenied { .. })
    ));

    let events = collect(core.run_turn("q".to_string(), None)).await;
    assert!(matches!(events.as_slice(), [TurnEvent::Error { .. }]));

    core.release_lock();
    assert!(core.acquire_query_lock());
    core.release_lock();
}

#[tokio::test]
async fn test_full_state_reports_lock_and_queue() {
    let temp = TempDir::new().unwrap();
    let core = build_core(&temp).await;
    core.register("doc1", AssetKind::Document, "/raw/doc1.pdf").await.unwrap();
    core.mark_raw("doc1").await.unwrap();

    let state = core.get_full_state().await;
    assert_eq!(state.lock.status, LockStatus::Idle);
    assert_eq!(state.registry.queue_length, 1);
    assert_eq!(state.registry.global_state, GlobalState::Waiting);

    let handle = core.start_ingestion("batch-3").unwrap();
    assert_eq!(core.get_full_state().await.lock.status, LockStatus::Ingesting);
    handle.await.unwrap().unwrap();

    let state = core.get_full_state().await;
    assert_eq!(state.lock.status, LockStatus::Idle);
    assert_eq!(state.registry.queue_length, 0);
    assert_eq!(core.assets().await.len(), 1);
}
