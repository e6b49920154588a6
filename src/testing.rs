//! Scripted model stubs shared by the unit tests.

use crate::embedding::{Embedding, EmbeddingProvider};
use crate::error::{AgentError, AgentResult};
use crate::llm::{ChatMessage, ModelProvider, Models};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Returns queued replies in order, then `fallback` forever. Records every prompt.
pub struct StubModel {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    pub prompts: Mutex<Vec<String>>,
}

impl StubModel {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            fallback: String::new(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: &str) -> Self {
        self.fallback = fallback.to_string();
        self
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> String {
        self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn next_reply(&self, prompt: String) -> String {
        self.prompts.lock().unwrap().push(prompt);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait::async_trait]
impl ModelProvider for StubModel {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn generate_text(&self, prompt: &str) -> AgentResult<String> {
        Ok(self.next_reply(prompt.to_string()))
    }

    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        on_chunk: Option<mpsc::UnboundedSender<String>>,
        cancel: Option<&CancellationToken>,
    ) -> AgentResult<String> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        let reply = self.next_reply(prompt);

        if let Some(tx) = on_chunk {
            let chars: Vec<char> = reply.chars().collect();
            for piece in chars.chunks(7) {
                if cancel.map_or(false, |c| c.is_cancelled()) {
                    return Err(AgentError::Cancelled);
                }
                let _ = tx.send(piece.iter().collect());
                tokio::task::yield_now().await;
            }
        } else if cancel.map_or(false, |c| c.is_cancelled()) {
            return Err(AgentError::Cancelled);
        }
        Ok(reply)
    }
}

/// Model whose every call fails
pub struct FailingModel;

#[async_trait::async_trait]
impl ModelProvider for FailingModel {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn generate_text(&self, _prompt: &str) -> AgentResult<String> {
        Err(AgentError::provider("model unavailable"))
    }

    async fn generate_chat(
        &self,
        _messages: &[ChatMessage],
        _on_chunk: Option<mpsc::UnboundedSender<String>>,
        _cancel: Option<&CancellationToken>,
    ) -> AgentResult<String> {
        Err(AgentError::provider("model unavailable"))
    }
}

/// Embeds by keyword: the first key contained in the text picks the vector
pub struct StubEmbedder {
    pub table: Vec<(String, Vec<f32>)>,
    pub default: Vec<f32>,
}

impl StubEmbedder {
    pub fn fixed(vector: Vec<f32>) -> Self {
        Self {
            table: Vec::new(),
            default: vector,
        }
    }

    pub fn keyed(table: &[(&str, Vec<f32>)], default: Vec<f32>) -> Self {
        Self {
            table: table.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            default,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Embedding> {
        let values = self
            .table
            .iter()
            .find(|(key, _)| text.contains(key.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.default.clone());
        Ok(Embedding { values })
    }

    async fn embed_batch(&self, texts: &[&str]) -> anyhow::Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

pub fn models(chat: StubModel, embedder: Option<StubEmbedder>) -> (Models, Arc<StubModel>) {
    let chat = Arc::new(chat);
    let models = Models::new(
        chat.clone(),
        embedder.map(|e| Arc::new(e) as Arc<dyn EmbeddingProvider>),
    );
    (models, chat)
}
