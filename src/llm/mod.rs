//! Chat / completion model providers.
//!
//! Any provider must support single-shot completion and chat. Chat may stream:
//! when a chunk sender is supplied, each text delta is forwarded as it arrives
//! and the full text is still returned at the end.

pub mod ollama;
pub mod openai;

use crate::config::{Config, ProviderKind};
use crate::embedding::ollama::OllamaEmbedding;
use crate::embedding::openai::OpenAIEmbedding;
use crate::embedding::EmbeddingProvider;
use crate::error::{AgentError, AgentResult};
use anyhow::Context;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Chat / completion provider trait
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Single-shot completion
    async fn generate_text(&self, prompt: &str) -> AgentResult<String>;

    /// Chat completion. With `on_chunk`, the response streams through the sender;
    /// a chunk arriving after `cancel` fires is discarded and `Cancelled` is returned.
    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        on_chunk: Option<mpsc::UnboundedSender<String>>,
        cancel: Option<&CancellationToken>,
    ) -> AgentResult<String>;
}

/// The model stack every pipeline stage talks to
#[derive(Clone)]
pub struct Models {
    pub chat: Arc<dyn ModelProvider>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Models {
    pub fn new(chat: Arc<dyn ModelProvider>, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { chat, embedder }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let chat: Arc<dyn ModelProvider> = match config.llm_provider {
            ProviderKind::Ollama => Arc::new(ollama::OllamaChat::new(
                &config.ollama_host,
                &config.chat_model,
            )),
            ProviderKind::OpenAi => {
                let key = config
                    .openai_api_key
                    .as_deref()
                    .context("OPENAI_API_KEY is required when LLM_PROVIDER=openai")?;
                Arc::new(openai::OpenAIChat::new(
                    key,
                    &config.openai_base_url,
                    &config.chat_model,
                ))
            }
            ProviderKind::None => anyhow::bail!("A chat provider is required (LLM_PROVIDER)"),
        };

        let embedder: Option<Arc<dyn EmbeddingProvider>> = match config.embedding_provider {
            ProviderKind::Ollama => Some(Arc::new(OllamaEmbedding::new(
                &config.ollama_host,
                &config.embedding_model,
            ))),
            ProviderKind::OpenAi => match config.openai_api_key.as_deref() {
                Some(key) => Some(Arc::new(OpenAIEmbedding::new(
                    key,
                    &config.openai_base_url,
                    &config.embedding_model,
                ))),
                None => {
                    tracing::warn!("OPENAI_API_KEY missing; embeddings disabled");
                    None
                }
            },
            ProviderKind::None => None,
        };

        Ok(Self { chat, embedder })
    }

    /// Embed `text`, or `None` when no embedder is configured or the call fails
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(embedding) => Some(embedding.values),
            Err(e) => {
                tracing::warn!("Embedding request failed: {}", e);
                None
            }
        }
    }
}

/// Map an HTTP error status to a provider error
pub fn parse_http_error(status: u16, body: &str, provider: &str) -> AgentError {
    let message = match status {
        401 | 403 => format!("{}: authentication failed", provider),
        404 => format!("{}: model or endpoint not found: {}", provider, body),
        429 => format!("{}: rate limited: {}", provider, body),
        500..=599 => format!("{}: server error ({}): {}", provider, status, body),
        _ => format!("{}: HTTP {}: {}", provider, status, body),
    };
    AgentError::Provider(message)
}

/// Read a line-oriented streaming body (NDJSON or SSE), passing every complete
/// line through `parse_line`. Text deltas are accumulated and forwarded.
pub(crate) async fn drain_line_stream<F>(
    response: reqwest::Response,
    on_chunk: Option<&mpsc::UnboundedSender<String>>,
    cancel: Option<&CancellationToken>,
    parse_line: F,
) -> AgentResult<String>
where
    F: FnMut(&str) -> AgentResult<LineEvent>,
{
    drain_lines(Box::pin(response.bytes_stream()), on_chunk, cancel, parse_line).await
}

async fn drain_lines<S, B, E, F>(
    mut stream: S,
    on_chunk: Option<&mpsc::UnboundedSender<String>>,
    cancel: Option<&CancellationToken>,
    mut parse_line: F,
) -> AgentResult<String>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<AgentError>,
    F: FnMut(&str) -> AgentResult<LineEvent>,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut full = String::new();
    let emit = |text: String, full: &mut String| {
        if let Some(tx) = on_chunk {
            let _ = tx.send(text.clone());
        }
        full.push_str(&text);
    };

    while let Some(item) = stream.next().await {
        if cancel.map_or(false, |c| c.is_cancelled()) {
            return Err(AgentError::Cancelled);
        }
        let bytes = item.map_err(Into::<AgentError>::into)?;
        pending.extend_from_slice(bytes.as_ref());

        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line).map_err(as_provider_error)? {
                LineEvent::Delta(text) => emit(text, &mut full),
                LineEvent::Done => return Ok(full),
                LineEvent::Skip => {}
            }
        }
    }

    let tail = String::from_utf8_lossy(&pending).trim().to_string();
    if !tail.is_empty() {
        if let LineEvent::Delta(text) = parse_line(&tail).map_err(as_provider_error)? {
            emit(text, &mut full);
        }
    }

    Ok(full)
}

/// A stream that cannot be read is the provider's failure, whatever the cause
fn as_provider_error(err: AgentError) -> AgentError {
    match err {
        err @ (AgentError::Provider(_) | AgentError::Cancelled) => err,
        other => AgentError::provider(format!("Malformed stream line: {}", other)),
    }
}

pub(crate) enum LineEvent {
    Delta(String),
    Done,
    Skip,
}

/// Strip a surrounding markdown code fence from model output
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return text.to_string();
    }
    let after_open = match trimmed.find('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => return String::new(),
    };
    match after_open.rfind("```") {
        Some(end) => after_open[..end].to_string(),
        None => after_open.to_string(),
    }
}
