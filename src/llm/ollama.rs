use super::{drain_line_stream, parse_http_error, ChatMessage, LineEvent, ModelProvider};
use crate::error::{AgentError, AgentResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Ollama chat / completion provider
pub struct OllamaChat {
    client: Client,
    host: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponseLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

impl OllamaChat {
    pub fn new(host: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> AgentResult<reqwest::Response> {
        let url = format!("{}{}", self.host, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::provider(format!("Failed to send request to Ollama: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(parse_http_error(status, &body, "ollama"));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ModelProvider for OllamaChat {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate_text(&self, prompt: &str) -> AgentResult<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response = self.post("/api/generate", &request).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AgentError::provider(format!("Failed to parse Ollama response: {}", e)))?;
        Ok(parsed.response)
    }

    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        on_chunk: Option<mpsc::UnboundedSender<String>>,
        cancel: Option<&CancellationToken>,
    ) -> AgentResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: on_chunk.is_some(),
        };
        let response = self.post("/api/chat", &request).await?;

        if on_chunk.is_none() {
            let line: ChatResponseLine = response
                .json()
                .await
                .map_err(|e| AgentError::provider(format!("Failed to parse Ollama response: {}", e)))?;
            if cancel.map_or(false, |c| c.is_cancelled()) {
                return Err(AgentError::Cancelled);
            }
            return Ok(line.message.map(|m| m.content).unwrap_or_default());
        }

        drain_line_stream(response, on_chunk.as_ref(), cancel, parse_chat_line).await
    }
}

/// One NDJSON line of a streamed `/api/chat` response
fn parse_chat_line(line: &str) -> AgentResult<LineEvent> {
    let parsed: ChatResponseLine = serde_json::from_str(line)
        .map_err(|e| AgentError::provider(format!("Malformed stream line: {}", e)))?;
    if let Some(error) = parsed.error {
        return Err(AgentError::provider(format!("ollama: {}", error)));
    }
    if parsed.done {
        return Ok(match parsed.message {
            Some(m) if !m.content.is_empty() => LineEvent::Delta(m.content),
            _ => LineEvent::Done,
        });
    }
    Ok(parsed
        .message
        .map(|m| LineEvent::Delta(m.content))
        .unwrap_or(LineEvent::Skip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_lines() {
        assert!(matches!(
            parse_chat_line(r#"{"message": {"role": "assistant", "content": "Hi"}, "done": false}"#),
            Ok(LineEvent::Delta(ref t)) if t == "Hi"
        ));
        assert!(matches!(parse_chat_line(r#"{"done": true}"#), Ok(LineEvent::Done)));
        assert!(matches!(
            parse_chat_line(r#"{"error": "model not loaded"}"#),
            Err(AgentError::Provider(ref m)) if m.contains("model not loaded")
        ));
        assert!(matches!(
            parse_chat_line("<html>bad gateway</html>"),
            Err(AgentError::Provider(ref m)) if m.starts_with("Malformed stream line")
        ));
    }
}
