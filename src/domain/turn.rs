//! Reasoning turns: one session answering a user's questions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::evidence::Evidence;

/// Status of a reasoning turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Refining the question into search parameters
    Preparing,
    Researching,
    Evaluating,
    /// Running vision / verification experts
    Strengthening,
    /// Streaming the final answer
    Finalizing,
    /// Waiting for the next question
    Idle,
    Failed,
}

impl Default for TurnStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl TurnStatus {
    /// Whether a question is currently being worked on
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the message history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Derived flags routing the conditional branches of a turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub need_vision: bool,

    #[serde(default)]
    pub need_sandbox: bool,

    /// Key into the configured vision strategies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_focus: Option<String>,
}

impl Manifest {
    /// Flags only ever switch on; an escalation cannot be undone by a later pass
    pub fn merge(&mut self, other: Manifest) {
        self.need_vision |= other.need_vision;
        self.need_sandbox |= other.need_sandbox;
        if other.vision_strategy.is_some() {
            self.vision_strategy = other.vision_strategy;
        }
        if other.reasoning_focus.is_some() {
            self.reasoning_focus = other.reasoning_focus;
        }
    }
}

/// Durable snapshot of a reasoning session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTurn {
    pub turn_id: String,

    /// Human-readable title, derived from the first question
    pub title: String,

    pub status: TurnStatus,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Ranked evidence gathered for the current question
    #[serde(default)]
    pub evidence: Vec<Evidence>,

    /// Refetches honoured for the current question
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub manifest: Manifest,

    /// Short log of node decisions for the current question
    #[serde(default)]
    pub reasoning_chain: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReasoningTurn {
    pub fn new(turn_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            turn_id: turn_id.into(),
            title: "New Chat".to_string(),
            status: TurnStatus::Idle,
            messages: Vec::new(),
            evidence: Vec::new(),
            retry_count: 0,
            manifest: Manifest::default(),
            reasoning_chain: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Reset per-question state and record the new question
    pub fn begin_question(&mut self, question: &str) {
        if self.messages.is_empty() {
            let head: String = question.chars().take(12).collect();
            self.title = format!("Chat-{}", head);
        }
        self.messages.push(ChatMessage::new(Role::User, question));
        self.evidence.clear();
        self.retry_count = 0;
        self.manifest = Manifest::default();
        self.reasoning_chain = vec![format!("Init: {}", question)];
        self.set_status(TurnStatus::Preparing);
    }

    pub fn set_status(&mut self, status: TurnStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// The last `window` messages joined as `role: content` lines
    pub fn context_query(&self, window: usize) -> String {
        let start = self.messages.len().saturating_sub(window.max(1));
        self.messages[start..]
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                format!("{}: {}", role, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn note(&mut self, entry: impl Into<String>) {
        self.reasoning_chain.push(entry.into());
    }
}
