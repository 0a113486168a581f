//! Query track: the reflective reasoning loop.
//!
//! A turn walks `research → evaluate → [research again] → vision? → logic? →
//! synthesize`. The loop is a plain interpreter over [`Node`]: each node does
//! its work and returns a [`Transition`]. Refetching is bounded by
//! `max_retries`; once the bound is hit the evaluator's verdict is forced to
//! `proceed`.
//!
//! Progress is streamed as [`TurnEvent`]s over an mpsc channel. Dropping the
//! receiver cancels the turn at its next emission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    ChatClient, ExpertError, ExpertKind, ExpertRegistry, ExpertRequest, ExpertResponse, LlmError,
};
use crate::domain::{
    ChatMessage, Citation, Evidence, Locator, Manifest, Modality, Node, ReasoningTurn, Role,
    TurnEvent, TurnStatus,
};

use super::lock::{ResourceLock, Track};
use super::prompts::{self, SynthesisInput};
use super::ranking::{pool_size, Preferences, RankingEngine};
use super::sessions::{SessionError, SessionStore};

/// Refetches allowed per question
pub const MAX_RETRIES: u32 = 2;

pub const DEFAULT_VISION_STRATEGY: &str = "scene_description";
pub const DEFAULT_VISION_INSTRUCTION: &str = "Please describe the visual content of this frame.";

const EVENT_BUFFER: usize = 64;
const MAX_REFINED_TOP_K: usize = 20;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Expert(#[from] ExpertError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Expert '{expert}' returned an unusable result: {detail}")]
    MalformedResult { expert: ExpertKind, detail: String },

    #[error("Reasoning loop exceeded {0} node visits")]
    StepBudget(usize),
}

/// Tunables for the reasoning loop
#[derive(Debug, Clone)]
pub struct ReasonerSettings {
    pub max_retries: u32,
    pub top_k: usize,

    /// Messages included in the context query
    pub history_window: usize,

    /// Root of extracted video frames: `<frames_dir>/<asset>/frames/time_<secs>.jpg`
    pub frames_dir: PathBuf,

    /// Vision strategy name → instruction
    pub strategies: HashMap<String, String>,
}

impl Default for ReasonerSettings {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            top_k: 5,
            history_window: 3,
            frames_dir: PathBuf::from("processed/video"),
            strategies: HashMap::new(),
        }
    }
}

impl ReasonerSettings {
    /// Upper bound on node visits for one question
    fn step_budget(&self) -> usize {
        // research + evaluate per attempt, then vision, logic, synthesize
        2 * (self.max_retries as usize + 1) + 3
    }
}

/// Evaluator verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalAction {
    Proceed,
    Refetch,
}

/// Parsed evaluator reply
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub action: EvalAction,
    pub reason: Option<String>,

    /// Flags requested through `trigger_tools`
    pub escalation: Manifest,
}

impl EvalReport {
    pub fn proceed() -> Self {
        Self {
            action: EvalAction::Proceed,
            reason: None,
            escalation: Manifest::default(),
        }
    }

    /// Anything other than an explicit `refetch` counts as `proceed`
    pub fn from_json(value: &Value) -> Self {
        let action = match value["action"].as_str() {
            Some(a) if a.trim().eq_ignore_ascii_case("refetch") => EvalAction::Refetch,
            _ => EvalAction::Proceed,
        };
        let tools = &value["trigger_tools"];
        Self {
            action,
            reason: value["reason"].as_str().map(str::to_string),
            escalation: Manifest {
                need_vision: tools["call_reasoning_eye"].as_bool().unwrap_or(false),
                need_sandbox: tools["call_sandbox"].as_bool().unwrap_or(false),
                ..Default::default()
            },
        }
    }
}

/// Apply the retry bound to an evaluator verdict
pub fn decide(action: EvalAction, retry_count: u32, max_retries: u32) -> EvalAction {
    match action {
        EvalAction::Refetch if retry_count < max_retries => EvalAction::Refetch,
        _ => EvalAction::Proceed,
    }
}

/// Manifest flags from the intent classifier
pub fn manifest_from_intent(value: &Value) -> Manifest {
    let text = |key: &str| {
        value[key]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Manifest {
        need_vision: value["need_vision"].as_bool().unwrap_or(false),
        need_sandbox: value["need_sandbox"].as_bool().unwrap_or(false),
        vision_strategy: text("vision_strategy"),
        reasoning_focus: text("reasoning_focus"),
    }
}

/// Search parameters distilled from the refiner reply
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPlan {
    pub query: String,
    pub top_k: usize,
    pub preferences: Preferences,
}

impl SearchPlan {
    pub fn from_refiner(value: &Value, question: &str, default_top_k: usize) -> Self {
        let params = &value["search_params"];
        let keywords: Vec<&str> = params["keywords"]
            .as_array()
            .map(|k| k.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let query = if keywords.is_empty() {
            question.to_string()
        } else {
            keywords.join(" ")
        };

        let top_k = params["top_k"]
            .as_u64()
            .map(|k| (k as usize).clamp(1, MAX_REFINED_TOP_K))
            .unwrap_or(default_top_k);

        Self {
            query,
            top_k,
            preferences: Preferences::from_hints(&value["preferences"]),
        }
    }
}

/// What a node asks the interpreter to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Go to the node's fixed successor (or finish after the last node)
    Continue,

    /// Refetch: back to research
    Retry,

    Advance(Node),

    /// The caller went away
    Abort,
}

enum Outcome {
    Completed,
    Cancelled,
}

/// Per-question working state
struct TurnRun {
    question: String,
    turn: ReasoningTurn,
    tx: mpsc::Sender<TurnEvent>,
    audit_reason: Option<String>,
    vision_feedback: Option<String>,
    verification: Option<String>,
    answer: String,
}

impl TurnRun {
    /// False once the receiver has been dropped
    async fn emit(&self, event: TurnEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    fn has_video(&self) -> bool {
        self.turn.evidence.iter().any(|e| e.modality == Modality::Video)
    }
}

pub fn new_turn_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("CH-{}", id[..8].to_uppercase())
}

pub struct ReflectiveReasoner {
    lock: Arc<ResourceLock>,
    experts: Arc<ExpertRegistry>,
    chat: Arc<dyn ChatClient>,
    ranking: RankingEngine,
    sessions: SessionStore,
    settings: ReasonerSettings,
}

impl ReflectiveReasoner {
    pub fn new(
        lock: Arc<ResourceLock>,
        experts: Arc<ExpertRegistry>,
        chat: Arc<dyn ChatClient>,
        sessions: SessionStore,
        settings: ReasonerSettings,
    ) -> Self {
        Self {
            lock,
            experts,
            chat,
            ranking: RankingEngine::default(),
            sessions,
            settings,
        }
    }

    pub fn with_ranking(mut self, ranking: RankingEngine) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn settings(&self) -> &ReasonerSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Start answering `question`. Events arrive on the returned receiver;
    /// if the accelerator is busy the only event is an `error`.
    pub fn run_turn(self: &Arc<Self>, question: String, turn_id: Option<String>) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let turn_id = turn_id.unwrap_or_else(new_turn_id);

        let Some(guard) = self.lock.try_acquire_guard(Track::Query, &turn_id) else {
            let status = self.lock.snapshot().status;
            warn!(%turn_id, ?status, "Query denied: accelerator busy");
            let _ = tx.try_send(TurnEvent::error(format!(
                "Accelerator locked: system is currently {:?}. Please wait.",
                status
            )));
            return rx;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Held until the turn ends, however it ends
            let _guard = guard;
            this.execute(question, turn_id, tx).await;
        });
        rx
    }

    #[instrument(skip(self, question, tx))]
    async fn execute(&self, question: String, turn_id: String, tx: mpsc::Sender<TurnEvent>) {
        let turn = match self.sessions.load_or_new(&turn_id).await {
            Ok(turn) => turn,
            Err(e) => {
                error!(error = %e, "Could not load session");
                let _ = tx.send(TurnEvent::error(e.to_string())).await;
                return;
            }
        };

        let mut run = TurnRun {
            question,
            turn,
            tx,
            audit_reason: None,
            vision_feedback: None,
            verification: None,
            answer: String::new(),
        };
        run.turn.begin_question(&run.question);
        self.persist(&run.turn).await;
        info!(question = %run.question, "Turn started");

        match self.drive(&mut run).await {
            Ok(Outcome::Completed) => {
                run.turn.set_status(TurnStatus::Idle);
                self.persist(&run.turn).await;
                let citations: Vec<Citation> = run.turn.evidence.iter().map(Citation::from).collect();
                info!(citations = citations.len(), retries = run.turn.retry_count, "Turn completed");
                run.emit(TurnEvent::FinalResult {
                    answer: run.answer.clone(),
                    citations,
                    status: "completed".to_string(),
                })
                .await;
            }
            Ok(Outcome::Cancelled) => {
                info!("Caller disconnected; turn cancelled");
                run.turn.note("Cancelled by client");
                run.turn.set_status(TurnStatus::Idle);
                self.persist(&run.turn).await;
            }
            Err(e) => {
                error!(error = %e, "Turn failed");
                run.turn.note(format!("Error: {}", e));
                run.turn.set_status(TurnStatus::Failed);
                self.persist(&run.turn).await;
                run.emit(TurnEvent::error(e.to_string())).await;
            }
        }
    }

    /// Snapshot failures are logged, never fatal to the turn
    async fn persist(&self, turn: &ReasoningTurn) {
        if let Err(e) = self.sessions.save(turn).await {
            warn!(turn_id = %turn.turn_id, error = %e, "Failed to persist session");
        }
    }

    async fn set_status(&self, run: &mut TurnRun, status: TurnStatus) {
        if run.turn.status != status {
            run.turn.set_status(status);
            self.persist(&run.turn).await;
        }
    }

    async fn drive(&self, run: &mut TurnRun) -> Result<Outcome, TurnError> {
        let budget = self.settings.step_budget();
        let mut node = Node::Research;

        for _ in 0..budget {
            debug!(node = node.as_str(), "Entering node");
            if !run.emit(TurnEvent::node_start(node)).await {
                return Ok(Outcome::Cancelled);
            }

            let transition = match node {
                Node::Research => self.research(run).await?,
                Node::Evaluate => self.evaluate(run).await?,
                Node::Vision => self.vision(run).await?,
                Node::Logic => self.logic(run).await?,
                Node::Synthesize => self.synthesize(run).await?,
            };

            node = match transition {
                Transition::Continue => match node.successor() {
                    Some(next) => next,
                    None => return Ok(Outcome::Completed),
                },
                Transition::Retry => Node::Research,
                Transition::Advance(next) => next,
                Transition::Abort => return Ok(Outcome::Cancelled),
            };
        }

        Err(TurnError::StepBudget(budget))
    }

    /// Branch after evaluation
    fn route_after_evaluate(manifest: &Manifest) -> Node {
        if manifest.need_vision {
            Node::Vision
        } else {
            Self::route_after_vision(manifest)
        }
    }

    fn route_after_vision(manifest: &Manifest) -> Node {
        if manifest.need_sandbox {
            Node::Logic
        } else {
            Node::Synthesize
        }
    }

    async fn research(&self, run: &mut TurnRun) -> Result<Transition, TurnError> {
        let attempt = run.turn.retry_count + 1;
        info!(attempt, "Research");

        let context = run.turn.context_query(self.settings.history_window);
        let refined = self
            .chat
            .complete_json(&prompts::query_refiner(&run.question, &context, attempt > 1))
            .await?;
        let plan = SearchPlan::from_refiner(&refined, &run.question, self.settings.top_k);

        self.set_status(run, TurnStatus::Researching).await;

        let request = ExpertRequest::new()
            .with("query", plan.query.clone())
            .with("top_k", pool_size(plan.top_k))
            .with("preferences", refined["preferences"].clone());
        let response = self.experts.invoke(ExpertKind::Search, request).await?;
        let candidates = parse_candidates(response)?;
        let retrieved = candidates.len();

        let ranked = self
            .ranking
            .rank(&plan.query, candidates, &plan.preferences, plan.top_k);
        run.turn.evidence = ranked.into_iter().map(|c| c.evidence).collect();

        let intent = self
            .chat
            .complete_json(&prompts::intent_check(&run.question, &run.turn.evidence, run.has_video()))
            .await?;
        let manifest = manifest_from_intent(&intent);
        let focus = manifest.reasoning_focus.clone().unwrap_or_else(|| "general".to_string());
        run.turn.manifest.merge(manifest);

        run.turn.note(format!(
            "Retrieved {} candidates, kept {}. Intent: {}",
            retrieved,
            run.turn.evidence.len(),
            focus
        ));
        Ok(Transition::Continue)
    }

    async fn evaluate(&self, run: &mut TurnRun) -> Result<Transition, TurnError> {
        self.set_status(run, TurnStatus::Evaluating).await;

        let prompt = prompts::evidence_evaluator(&run.question, &run.turn.evidence);
        let report = match self.chat.complete_json(&prompt).await {
            Ok(value) => EvalReport::from_json(&value),
            Err(LlmError::Malformed(detail)) => {
                warn!(%detail, "Unparsable audit; proceeding");
                EvalReport::proceed()
            }
            Err(e) => return Err(e.into()),
        };

        run.turn.manifest.merge(report.escalation.clone());
        run.audit_reason = report.reason.clone();

        let decision = decide(report.action, run.turn.retry_count, self.settings.max_retries);
        if decision == EvalAction::Refetch {
            run.turn.retry_count += 1;
            warn!(retry = run.turn.retry_count, "Evidence insufficient, refetching");
            run.turn.note(format!("Audit: refetch ({}/{})", run.turn.retry_count, self.settings.max_retries));
            self.persist(&run.turn).await;
            return Ok(Transition::Retry);
        }

        if report.action == EvalAction::Refetch {
            warn!(retries = run.turn.retry_count, "Max retries reached; forcing proceed");
            run.turn.note("Audit: refetch requested at retry limit, proceeding");
        } else {
            run.turn.note("Audit: proceed");
        }
        self.persist(&run.turn).await;

        Ok(Transition::Advance(Self::route_after_evaluate(&run.turn.manifest)))
    }

    async fn vision(&self, run: &mut TurnRun) -> Result<Transition, TurnError> {
        self.set_status(run, TurnStatus::Strengthening).await;
        let next = Transition::Advance(Self::route_after_vision(&run.turn.manifest));

        let target = run.turn.evidence.iter().find_map(|e| match (e.modality, e.locator) {
            (Modality::Video, Some(Locator::Timestamp(ts))) => Some((e.source_asset_id.clone(), ts)),
            _ => None,
        });
        let Some((asset_id, timestamp)) = target else {
            run.turn.note("Vision skipped: no video evidence");
            return Ok(next);
        };

        let frames = self.settings.frames_dir.join(&asset_id).join("frames");
        let Some(frame) = nearest_frame(&frames, timestamp).await else {
            warn!(%asset_id, timestamp, "No extracted frame near timestamp");
            run.vision_feedback = Some("Frame not found.".to_string());
            run.turn.note(format!("Vision: no frame for {} at {:.1}s", asset_id, timestamp));
            return Ok(next);
        };

        let strategy = run
            .turn
            .manifest
            .vision_strategy
            .clone()
            .unwrap_or_else(|| DEFAULT_VISION_STRATEGY.to_string());
        let instruction = self
            .settings
            .strategies
            .get(&strategy)
            .map(String::as_str)
            .unwrap_or(DEFAULT_VISION_INSTRUCTION);

        let request = ExpertRequest::new()
            .with("image", frame.display().to_string())
            .with("prompt", format!("{} Context: {}", instruction, run.question));
        let response = self.experts.invoke(ExpertKind::Vision, request).await?;

        let feedback = response
            .response_text
            .or_else(|| response.extra.get("response").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "Vision parse failed.".to_string());
        run.vision_feedback = Some(feedback);
        run.turn.note(format!(
            "Vision: analysed frame {} at {:.1}s using {}",
            asset_id, timestamp, strategy
        ));
        Ok(next)
    }

    async fn logic(&self, run: &mut TurnRun) -> Result<Transition, TurnError> {
        self.set_status(run, TurnStatus::Strengthening).await;

        let prep = self
            .chat
            .complete_json(&prompts::sandbox_prep(&run.turn.evidence))
            .await?;
        let expression = prep["expression"].as_str().map(str::trim).unwrap_or("empty");

        let verification = if expression.is_empty() || expression.eq_ignore_ascii_case("empty") {
            "No verification needed: no formula extracted.".to_string()
        } else {
            info!(%expression, "Invoking sandbox");
            let response = self
                .experts
                .invoke(ExpertKind::Sandbox, ExpertRequest::new().with_params(prep.clone()))
                .await?;
            let result = response
                .result
                .map(|r| match r {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .or(response.response_text)
                .unwrap_or_default();
            format!("Verified: {}", result)
        };

        run.turn.note(format!("Logic: {}", verification));
        run.verification = Some(verification);
        Ok(Transition::Continue)
    }

    async fn synthesize(&self, run: &mut TurnRun) -> Result<Transition, TurnError> {
        self.set_status(run, TurnStatus::Finalizing).await;

        let history = run.turn.context_query(self.settings.history_window);
        let prompt = prompts::synthesizer(&SynthesisInput {
            question: &run.question,
            history: &history,
            evidence: &run.turn.evidence,
            vision_feedback: run.vision_feedback.as_deref(),
            verification: run.verification.as_deref(),
            audit_reason: run.audit_reason.as_deref(),
        });

        let mut tokens = self.chat.stream(&prompt).await?;
        let mut answer = String::new();
        while let Some(token) = tokens.next().await {
            let token = token?;
            answer.push_str(&token);
            if !run.emit(TurnEvent::Token { content: token }).await {
                return Ok(Transition::Abort);
            }
        }

        run.turn.messages.push(ChatMessage::new(Role::Assistant, answer.clone()));
        run.turn.note("Synthesis complete");
        run.answer = answer;
        Ok(Transition::Continue)
    }
}

/// Decode the search expert's `result` array
fn parse_candidates(response: ExpertResponse) -> Result<Vec<Evidence>, TurnError> {
    match response.result {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Evidence>, _>>()
            .map_err(|e| TurnError::MalformedResult {
                expert: ExpertKind::Search,
                detail: e.to_string(),
            }),
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(TurnError::MalformedResult {
            expert: ExpertKind::Search,
            detail: format!("expected an array, got {}", other),
        }),
    }
}

/// Frame file `time_<seconds>.jpg` closest to `timestamp`
pub async fn nearest_frame(frames_dir: &Path, timestamp: f64) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(frames_dir).await.ok()?;
    let mut best: Option<(f64, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let seconds = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("time_"))
            .and_then(|s| s.parse::<f64>().ok());
        if let Some(seconds) = seconds {
            let distance = (seconds - timestamp).abs();
            if best.as_ref().map_or(true, |(d, _)| distance < *d) {
                best = Some((distance, path));
            }
        }
    }

    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_decide_bounds_refetch() {
        assert_eq!(decide(EvalAction::Refetch, 0, 2), EvalAction::Refetch);
        assert_eq!(decide(EvalAction::Refetch, 1, 2), EvalAction::Refetch);
        assert_eq!(decide(EvalAction::Refetch, 2, 2), EvalAction::Proceed);
        assert_eq!(decide(EvalAction::Proceed, 0, 2), EvalAction::Proceed);
    }

    #[test]
    fn test_eval_report_parsing() {
        let report = EvalReport::from_json(&json!({
            "action": "refetch",
            "reason": "off topic",
            "trigger_tools": {"call_reasoning_eye": true}
        }));
        assert_eq!(report.action, EvalAction::Refetch);
        assert!(report.escalation.need_vision);
        assert!(!report.escalation.need_sandbox);

        assert_eq!(EvalReport::from_json(&json!({"action": "maybe"})).action, EvalAction::Proceed);
    }

    #[test]
    fn test_search_plan_defaults() {
        let plan = SearchPlan::from_refiner(&json!({}), "what is attention", 5);
        assert_eq!(plan.query, "what is attention");
        assert_eq!(plan.top_k, 5);

        let plan = SearchPlan::from_refiner(
            &json!({"search_params": {"keywords": ["self", "attention"], "top_k": 500}}),
            "q",
            5,
        );
        assert_eq!(plan.query, "self attention");
        assert_eq!(plan.top_k, MAX_REFINED_TOP_K);
    }

    #[test]
    fn test_turn_id_format() {
        let id = new_turn_id();
        assert!(id.starts_with("CH-"));
        assert_eq!(id.len(), 11);
    }

    #[tokio::test]
    async fn test_nearest_frame() {
        let temp = TempDir::new().unwrap();
        for name in ["time_10.0.jpg", "time_20.0.jpg", "cover.jpg"] {
            std::fs::write(temp.path().join(name), b"jpg").unwrap();
        }

        let frame = nearest_frame(temp.path(), 17.2).await.unwrap();
        assert_eq!(frame.file_name().unwrap(), "time_20.0.jpg");
        assert!(nearest_frame(&temp.path().join("missing"), 1.0).await.is_none());
    }
}
