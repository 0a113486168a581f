//! Chat-completion client.
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint (DeepSeek by
//! default) through `async_openai`. JSON-mode calls drive the reasoning
//! decisions; the final answer is streamed token by token.

use std::pin::Pin;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Stream of answer tokens
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Chat API failures
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Chat API call failed: {0}")]
    Api(#[from] OpenAIError),

    #[error("Chat HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat API did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Chat API response malformed: {0}")]
    Malformed(String),
}

/// Which reasoning decision a prompt drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    QueryRefiner,
    IntentCheck,
    EvidenceEvaluator,
    SandboxPrep,
    Synthesizer,
}

/// A rendered prompt
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub kind: PromptKind,
    pub text: String,
}

impl Prompt {
    pub fn new(kind: PromptKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Trait for chat-completion backends
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Non-streaming call in JSON mode; the reply is parsed as a JSON value
    async fn complete_json(&self, prompt: &Prompt) -> Result<Value, LlmError>;

    /// Streaming call; yields answer tokens as they arrive
    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError>;
}

/// Strip Markdown code fences and surrounding whitespace from a model reply
pub fn clean_json_str(raw: &str) -> &str {
    let mut cleaned = raw.trim();
    if let Some(rest) = cleaned.strip_prefix("```") {
        // Drop the info string (e.g. `json`) on the opening fence line
        cleaned = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
        cleaned = cleaned.trim_end();
        cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    }
    cleaned.trim()
}

/// Parse a model reply that should contain a JSON object
pub fn parse_json_reply(raw: &str) -> Result<Value, LlmError> {
    let cleaned = clean_json_str(raw);
    if cleaned.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(cleaned)
        .map_err(|e| LlmError::Malformed(format!("{}: {}", e, cleaned.chars().take(200).collect::<String>())))
}

/// OpenAI-compatible chat client built on `async_openai`
pub struct OpenAiCompatClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, LlmError> {
        // No overall timeout on the HTTP client: answer streams may run long
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let base_url = base_url.into();
        let config = OpenAIConfig::new()
            .with_api_base(base_url.trim_end_matches('/'))
            .with_api_key(api_key.into());

        Ok(Self {
            client: Client::with_config(config).with_http_client(http),
            model: model.into(),
            request_timeout,
        })
    }

    fn request(&self, prompt: &Prompt, json_mode: bool) -> Result<CreateChatCompletionRequest, LlmError> {
        let message: ChatCompletionRequestMessage = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.text.as_str())
            .build()?
            .into();

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(vec![message]);
        if json_mode {
            args.response_format(ResponseFormat::JsonObject);
        }
        Ok(args.build()?)
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete_json(&self, prompt: &Prompt) -> Result<Value, LlmError> {
        debug!(kind = ?prompt.kind, "Chat completion (json mode)");
        let request = self.request(prompt, true)?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout(self.request_timeout))??;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Malformed("no choices in response".to_string()))?;

        parse_json_reply(&content)
    }

    async fn stream(&self, prompt: &Prompt) -> Result<TokenStream, LlmError> {
        debug!(kind = ?prompt.kind, "Chat completion (streaming)");
        let request = self.request(prompt, false)?;

        let chunks = tokio::time::timeout(self.request_timeout, self.client.chat().create_stream(request))
            .await
            .map_err(|_| LlmError::Timeout(self.request_timeout))??;

        let tokens = chunks.filter_map(|chunk| async move {
            match chunk {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .filter(|token| !token.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(LlmError::Api(e))),
            }
        });

        Ok(Box::pin(tokens))
    }
}
