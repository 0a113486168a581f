//! Shared test doubles: scripted experts and a scripted chat client.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

use acadagent::adapters::{
    ChatClient, Expert, ExpertError, ExpertRegistry, ExpertRequest, ExpertResponse, LlmError, Prompt,
    PromptKind, TokenStream,
};
use acadagent::core::{ReasonerSettings, ReflectiveReasoner, ResourceLock, SessionStore};
use acadagent::domain::{Evidence, Locator, Modality, TurnEvent};

type Handler = dyn Fn(&ExpertRequest) -> Result<ExpertResponse, ExpertError> + Send + Sync;

/// Expert answering from a closure and recording every request
pub struct FnExpert {
    name: String,
    handler: Box<Handler>,
    requests: Mutex<Vec<ExpertRequest>>,
}

impl FnExpert {
    pub fn new<F>(name: &str, handler: F) -> Arc<Self>
    where
        F: Fn(&ExpertRequest) -> Result<ExpertResponse, ExpertError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Always succeeds, reporting `/processed/<id>` as output
    pub fn ok(name: &str) -> Arc<Self> {
        Self::new(name, |req| {
            let id = req.get("id").and_then(Value::as_str).unwrap_or("unknown");
            Ok(ExpertResponse::success().with_processed_location(format!("/processed/{}", id)))
        })
    }

    pub fn requests(&self) -> Vec<ExpertRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Expert for FnExpert {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: ExpertRequest) -> Result<ExpertResponse, ExpertError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(&request)
    }
}

/// Chat client replaying canned JSON replies per prompt kind
pub struct ScriptedChat {
    queued: Mutex<HashMap<PromptKind, VecDeque<Value>>>,
    defaults: HashMap<PromptKind, Value>,
    tokens: Vec<String>,
    token_delay: Option<Duration>,
    calls: Mutex<Vec<PromptKind>>,
    streams: AtomicUsize,
}

impl ScriptedChat {
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(PromptKind::QueryRefiner, json!({}));
        defaults.insert(PromptKind::IntentCheck, json!({"need_vision": false, "need_sandbox": false}));
        defaults.insert(PromptKind::EvidenceEvaluator, json!({"action": "proceed"}));
        defaults.insert(PromptKind::SandboxPrep, json!({"expression": "empty"}));

        Self {
            queued: Mutex::new(HashMap::new()),
            defaults,
            tokens: vec!["The answer".to_string(), " is 42.".to_string()],
            token_delay: None,
            calls: Mutex::new(Vec::new()),
            streams: AtomicUsize::new(0),
        }
    }

    /// Reply used once, before falling back to the default
    pub fn then(self, kind: PromptKind, reply: Value) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(reply);
        self
    }

    /// Reply used whenever nothing is queued
    pub fn always(mut self, kind: PromptKind, reply: Value) -> Self {
        self.defaults.insert(kind, reply);
        self
    }

    pub fn tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Pause before each streamed token
    pub fn token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    pub fn count(&self, kind: PromptKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| **k == kind).count()
    }

    pub fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn complete_json(&self, prompt: &Prompt) -> Result<Value, LlmError> {
        self.calls.lock().unwrap().push(prompt.kind);
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&prompt.kind)
            .and_then(VecDeque::pop_front);
        Ok(queued
            .or_else(|| self.defaults.get(&prompt.kind).cloned())
            .unwrap_or_else(|| json!({})))
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        self.calls.lock().unwrap().push(prompt.kind);
        self.streams.fetch_add(1, Ordering::SeqCst);
        let tokens: Vec<Result<String, LlmError>> = self.tokens.iter().cloned().map(Ok).collect();
        let stream = futures_util::stream::iter(tokens);
        match self.token_delay {
            Some(delay) => Ok(Box::pin(stream.then(move |token| async move {
                tokio::time::sleep(delay).await;
                token
            }))),
            None => Ok(Box::pin(stream)),
        }
    }
}

pub fn document(source: &str, page: u32, similarity: f64) -> Evidence {
    Evidence {
        modality: Modality::Document,
        source_asset_id: source.to_string(),
        locator: Some(Locator::Page(page)),
        bounding_region: Some([0.1, 0.1, 0.9, 0.2]),
        content_type: None,
        text_excerpt: format!("{} page {}", source, page),
        embedding_similarity: similarity,
    }
}

pub fn video(source: &str, seconds: f64, similarity: f64) -> Evidence {
    Evidence {
        modality: Modality::Video,
        source_asset_id: source.to_string(),
        locator: Some(Locator::Timestamp(seconds)),
        bounding_region: None,
        content_type: Some("transcript_context".to_string()),
        text_excerpt: format!("{} at {}s", source, seconds),
        embedding_similarity: similarity,
    }
}

/// Search expert returning a fixed candidate list
pub fn search_returning(candidates: Vec<Evidence>) -> Arc<FnExpert> {
    let result = serde_json::to_value(candidates).unwrap();
    FnExpert::new("search", move |_| Ok(ExpertResponse::success().with_result(result.clone())))
}

pub struct ReasonerHarness {
    pub reasoner: Arc<ReflectiveReasoner>,
    pub lock: Arc<ResourceLock>,
    pub temp: TempDir,
}

impl ReasonerHarness {
    pub async fn new(experts: ExpertRegistry, chat: Arc<ScriptedChat>) -> Self {
        Self::with_settings(experts, chat, |_| {}).await
    }

    pub async fn with_settings<F>(experts: ExpertRegistry, chat: Arc<ScriptedChat>, tweak: F) -> Self
    where
        F: FnOnce(&mut ReasonerSettings),
    {
        let temp = TempDir::new().unwrap();
        let sessions = SessionStore::open(temp.path().join("sessions"))
            .await
            .unwrap();
        let mut settings = ReasonerSettings {
            frames_dir: temp.path().join("frames"),
            ..Default::default()
        };
        tweak(&mut settings);

        let lock = Arc::new(ResourceLock::new());
        let reasoner = Arc::new(ReflectiveReasoner::new(
            Arc::clone(&lock),
            Arc::new(experts),
            chat,
            sessions,
            settings,
        ));
        Self { reasoner, lock, temp }
    }

    pub async fn ask(&self, question: &str, turn_id: &str) -> Vec<TurnEvent> {
        let rx = self
            .reasoner
            .run_turn(question.to_string(), Some(turn_id.to_string()));
        collect(rx).await
    }
}

pub async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Nodes entered, in order
pub fn nodes(events: &[TurnEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::NodeStart { node, .. } => Some(node.as_str()),
            _ => None,
        })
        .collect()
}

/// Wait for the spawned turn or batch to drop its lock guard
pub async fn wait_released(lock: &ResourceLock) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !lock.is_query_allowed() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("lock was never released");
}
