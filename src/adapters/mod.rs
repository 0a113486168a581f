//! Expert interfaces for out-of-process specialists.
//!
//! Every specialist (recognition, clip indexing, vector ingestion, search,
//! vision, sandbox) sits behind the uniform [`Expert`] contract: a JSON
//! request in, a JSON response with a mandatory `status` out. The
//! [`ExpertRegistry`] indexes implementations by [`ExpertKind`].

pub mod llm;
pub mod subprocess;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::Asset;

pub use llm::{ChatClient, LlmError, OpenAiCompatClient, Prompt, PromptKind, TokenStream};
pub use subprocess::SubprocessExpert;

/// Capability a specialist provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertKind {
    DocumentRecognition,
    VideoRecognition,
    ClipIndexing,
    StructureGeneration,
    VectorIngestion,
    Search,
    Vision,
    Sandbox,
}

impl ExpertKind {
    pub const ALL: [ExpertKind; 8] = [
        ExpertKind::DocumentRecognition,
        ExpertKind::VideoRecognition,
        ExpertKind::ClipIndexing,
        ExpertKind::StructureGeneration,
        ExpertKind::VectorIngestion,
        ExpertKind::Search,
        ExpertKind::Vision,
        ExpertKind::Sandbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentRecognition => "document_recognition",
            Self::VideoRecognition => "video_recognition",
            Self::ClipIndexing => "clip_indexing",
            Self::StructureGeneration => "structure_generation",
            Self::VectorIngestion => "vector_ingestion",
            Self::Search => "search",
            Self::Vision => "vision",
            Self::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for ExpertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request object: asset fields (if any) merged with task parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpertRequest(pub Map<String, Value>);

impl ExpertRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the serialized fields of an asset
    pub fn for_asset(asset: &Asset) -> Self {
        match serde_json::to_value(asset) {
            Ok(Value::Object(map)) => Self(map),
            _ => Self::default(),
        }
    }

    /// Merge task parameters; keys in `params` win
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.0.extend(map);
        }
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// Status claimed by an expert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStatus {
    Success,
    Error,
    PartialSuccess,
}

/// Response object returned by an expert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertResponse {
    pub status: ExpertStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_location: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,

    /// Any further fields the expert returned
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExpertResponse {
    pub fn success() -> Self {
        Self {
            status: ExpertStatus::Success,
            message: None,
            processed_location: None,
            result: None,
            response_text: None,
            extra: Map::new(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_processed_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.processed_location = Some(location.into());
        self
    }

    pub fn with_response_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExpertStatus::Success
    }

    /// Pass through a `success` response; anything else becomes an error
    pub fn into_success(self, expert: &str) -> Result<Self, ExpertError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(ExpertError::Reported {
            expert: expert.to_string(),
            status: self.status,
            message: self.message.unwrap_or_default(),
        })
    }
}

/// Expert call failures. Every variant halts only the current asset or turn.
#[derive(Debug, Error)]
pub enum ExpertError {
    #[error("No expert registered for '{0}'")]
    NotRegistered(ExpertKind),

    #[error("Expert '{expert}' timed out after {timeout:?} and was killed")]
    Timeout { expert: String, timeout: Duration },

    #[error("Expert '{expert}' exited with code {code}: {stderr}")]
    NonZeroExit {
        expert: String,
        code: i32,
        stderr: String,
    },

    #[error("Expert '{expert}' produced unparsable output: {detail}")]
    MalformedOutput { expert: String, detail: String },

    #[error("Expert '{expert}' reported {status:?}: {message}")]
    Reported {
        expert: String,
        status: ExpertStatus,
        message: String,
    },

    #[error("Failed to launch expert '{expert}': {source}")]
    Spawn {
        expert: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExpertError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Trait for specialist collaborators
#[async_trait]
pub trait Expert: Send + Sync {
    /// Human-readable expert name
    fn name(&self) -> &str;

    /// Run one request to completion
    async fn invoke(&self, request: ExpertRequest) -> Result<ExpertResponse, ExpertError>;
}

/// Capability-indexed set of experts
#[derive(Default, Clone)]
pub struct ExpertRegistry {
    experts: HashMap<ExpertKind, Arc<dyn Expert>>,
}

impl ExpertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the expert for a capability
    pub fn register(&mut self, kind: ExpertKind, expert: Arc<dyn Expert>) {
        self.experts.insert(kind, expert);
    }

    pub fn with(mut self, kind: ExpertKind, expert: Arc<dyn Expert>) -> Self {
        self.register(kind, expert);
        self
    }

    pub fn get(&self, kind: ExpertKind) -> Option<&Arc<dyn Expert>> {
        self.experts.get(&kind)
    }

    pub fn kinds(&self) -> Vec<ExpertKind> {
        ExpertKind::ALL
            .into_iter()
            .filter(|k| self.experts.contains_key(k))
            .collect()
    }

    /// Invoke the expert for `kind`; only a `success` response is returned as `Ok`
    pub async fn invoke(
        &self,
        kind: ExpertKind,
        request: ExpertRequest,
    ) -> Result<ExpertResponse, ExpertError> {
        let expert = self.get(kind).ok_or(ExpertError::NotRegistered(kind))?;
        tracing::debug!(expert = %kind, "Dispatching expert request");
        expert.invoke(request).await?.into_success(kind.as_str())
    }
}
