use super::types::*;
use crate::host::EventSink;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Logger name on `notifications/message` events
const EVENT_LOGGER: &str = "code-agent";

/// MCP Protocol handler for JSON-RPC over stdio
pub struct Protocol {
    reader: BufReader<tokio::io::Stdin>,
    outbound: Outbound,
}

impl Protocol {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            outbound: Outbound::stdout(),
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    /// Read next JSON-RPC request from stdin
    pub async fn read_request(&mut self) -> Result<Option<JsonRpcRequest>> {
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await {
                Ok(0) => return Ok(None), // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let request: JsonRpcRequest = serde_json::from_str(trimmed)?;
                    return Ok(Some(request));
                }
                Err(_) => return Ok(None),
            }
        }
    }

    /// Create success response
    pub fn success_response<T: Serialize>(id: Value, result: T) -> JsonRpcResponse<T> {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create error response
    pub fn error_response(id: Value, error: JsonRpcError) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Handle on the single stdout writer. Responses and notifications from the
/// request loop, spawned calls and event sinks are queued here and written one
/// line at a time, so messages never interleave.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
}

impl Outbound {
    fn stdout() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut writer = tokio::io::stdout();
            while let Some(line) = rx.recv().await {
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    tracing::error!("Failed to write to stdout: {}", e);
                    break;
                }
            }
        });
        Self { tx }
    }

    #[cfg(test)]
    pub fn from_sender(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queue a JSON-RPC response
    pub fn send_response<T: Serialize>(&self, response: &JsonRpcResponse<T>) -> Result<()> {
        self.send_line(response)
    }

    /// Queue a JSON-RPC notification
    pub fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        self.send_line(&Notification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        })
    }

    fn send_line<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.tx
            .send(json)
            .map_err(|_| anyhow!("Output channel closed"))
    }
}

/// Forwards UI events to the client as `notifications/message`
pub struct McpEventSink {
    outbound: Outbound,
}

impl McpEventSink {
    pub fn new(outbound: Outbound) -> Self {
        Self { outbound }
    }
}

impl EventSink for McpEventSink {
    fn post_message(&self, kind: &str, payload: Value) {
        let params = json!({
            "level": "info",
            "logger": EVENT_LOGGER,
            "data": {
                "type": kind,
                "payload": payload,
            },
        });
        if let Err(e) = self.outbound.send_notification("notifications/message", params) {
            tracing::debug!("Dropped {} event: {}", kind, e);
        }
    }
}
