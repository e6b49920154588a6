use super::{drain_line_stream, parse_http_error, ChatMessage, LineEvent, ModelProvider};
use crate::error::{AgentError, AgentResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// OpenAI-compatible chat completions provider
pub struct OpenAIChat {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAIChat {
    pub fn new(api_key: &str, base_url: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> AgentResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            stream,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::provider(format!("Failed to send request to OpenAI: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(parse_http_error(status, &body, "openai"));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ModelProvider for OpenAIChat {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate_text(&self, prompt: &str) -> AgentResult<String> {
        self.generate_chat(&[ChatMessage::user(prompt)], None, None).await
    }

    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        on_chunk: Option<mpsc::UnboundedSender<String>>,
        cancel: Option<&CancellationToken>,
    ) -> AgentResult<String> {
        let response = self.send(messages, on_chunk.is_some()).await?;

        if on_chunk.is_none() {
            let parsed: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| AgentError::provider(format!("Failed to parse OpenAI response: {}", e)))?;
            if cancel.map_or(false, |c| c.is_cancelled()) {
                return Err(AgentError::Cancelled);
            }
            return Ok(parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message)
                .and_then(|m| m.content)
                .unwrap_or_default());
        }

        drain_line_stream(response, on_chunk.as_ref(), cancel, parse_sse_line).await
    }
}

/// One SSE line of a streamed chat completion
fn parse_sse_line(line: &str) -> AgentResult<LineEvent> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(LineEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(LineEvent::Done);
    }
    let parsed: ChatCompletionResponse = serde_json::from_str(data)
        .map_err(|e| AgentError::provider(format!("Malformed stream line: {}", e)))?;
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .map(LineEvent::Delta)
        .unwrap_or(LineEvent::Skip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_lines() {
        assert!(matches!(
            parse_sse_line(r#"data: {"choices": [{"index": 0, "delta": {"content": "Hi"}}]}"#),
            Ok(LineEvent::Delta(ref t)) if t == "Hi"
        ));
        assert!(matches!(parse_sse_line(": keep-alive"), Ok(LineEvent::Skip)));
        assert!(matches!(parse_sse_line("data: [DONE]"), Ok(LineEvent::Done)));
        assert!(matches!(
            parse_sse_line("data: {\"choices\": [trunc"),
            Err(AgentError::Provider(ref m)) if m.starts_with("Malformed stream line")
        ));
    }
}
