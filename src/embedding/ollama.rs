use super::{Embedding, EmbeddingProvider};
use crate::llm::parse_http_error;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

const PROVIDER: &str = "Ollama";

/// Ollama embedding provider (`/api/embed`, batched)
pub struct OllamaEmbedding {
    client: Client,
    host: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedding {
    pub fn new(host: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

/// Pair each input with its vector; empty or missing vectors are an error
fn into_embeddings(response: EmbedResponse, expected: usize, model: &str) -> Result<Vec<Embedding>> {
    if response.embeddings.len() != expected {
        anyhow::bail!(
            "{} returned {} embeddings for {} inputs",
            PROVIDER,
            response.embeddings.len(),
            expected
        );
    }
    if response.embeddings.iter().any(Vec::is_empty) {
        anyhow::bail!("{} returned an empty embedding for model {}", PROVIDER, model);
    }
    Ok(response
        .embeddings
        .into_iter()
        .map(|values| Embedding { values })
        .collect())
}

#[async_trait::async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.host);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .context("Failed to send embedding request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(parse_http_error(status, &body, PROVIDER).into());
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .context("Failed to parse Ollama embedding response")?;
        into_embeddings(parsed, texts.len(), &self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_must_cover_every_input() {
        let parsed: EmbedResponse =
            serde_json::from_str(r#"{"model": "m", "embeddings": [[0.1, 0.2], [0.3, 0.4]]}"#).unwrap();
        let out = into_embeddings(parsed, 2, "m").unwrap();
        assert_eq!(out[1].values, vec![0.3, 0.4]);

        let short: EmbedResponse = serde_json::from_str(r#"{"embeddings": [[0.1]]}"#).unwrap();
        assert!(into_embeddings(short, 2, "m").is_err());

        let empty: EmbedResponse = serde_json::from_str(r#"{"embeddings": [[]]}"#).unwrap();
        assert!(into_embeddings(empty, 1, "m").is_err());
    }
}
