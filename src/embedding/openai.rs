use super::{Embedding, EmbeddingProvider};
use crate::llm::parse_http_error;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PROVIDER: &str = "OpenAI";

/// Inputs per request; longer batches are split
const MAX_BATCH: usize = 256;

/// OpenAI-compatible embedding provider
pub struct OpenAIEmbedding {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIEmbedding {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn request(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .context("Failed to send embedding request to OpenAI")?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(parse_http_error(status, &body, PROVIDER).into());
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI embedding response")?;
        in_input_order(parsed, texts.len())
    }
}

/// Results may arrive out of order; `index` refers to the input position
fn in_input_order(response: EmbeddingResponse, expected: usize) -> Result<Vec<Embedding>> {
    let mut data = response.data;
    data.sort_by_key(|d| d.index);
    if data.len() != expected {
        anyhow::bail!("{} returned {} embeddings for {} inputs", PROVIDER, data.len(), expected);
    }
    Ok(data
        .into_iter()
        .map(|d| Embedding {
            values: d.embedding,
        })
        .collect())
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAIEmbedding {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            out.extend(self.request(batch).await?);
        }
        Ok(out)
    }
}
