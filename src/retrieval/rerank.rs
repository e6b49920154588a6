use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Secondary relevance scoring over retrieval candidates
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    /// Score `documents` against `query`; returns `(document index, relevance)` pairs
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Result<Vec<(usize, f32)>>;
}

/// Cohere/Jina-compatible rerank endpoint (REST API)
pub struct HttpReranker {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl HttpReranker {
    pub fn new(url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
            api_key,
            model: model.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Result<Vec<(usize, f32)>> {
        let request = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .context("Failed to send rerank request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Rerank API error ({}): {}", status, body);
        }

        let result: RerankResponse = response
            .json()
            .await
            .context("Failed to parse rerank response")?;

        Ok(result
            .results
            .into_iter()
            .filter(|r| r.index < documents.len())
            .map(|r| (r.index, r.relevance_score))
            .collect())
    }
}
