use super::protocol::{McpEventSink, Outbound, Protocol};
use super::types::*;
use crate::error::AgentError;
use crate::handlers::tool_handlers::AgentHandlers;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "code-agent-mcp";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main MCP Server
pub struct McpServer {
    protocol: Protocol,
    handlers: Arc<Mutex<AgentHandlers>>,
    /// Cancellation tokens of in-flight `tools/call` requests, keyed by request id
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl McpServer {
    pub fn new(handlers: AgentHandlers) -> Self {
        Self {
            protocol: Protocol::new(),
            handlers: Arc::new(Mutex::new(handlers)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn start(mut self) -> Result<()> {
        self.handlers.lock().await.load().await?;

        tracing::info!("MCP server started, waiting for requests...");

        let outbound = self.protocol.outbound();
        loop {
            match self.protocol.read_request().await {
                Ok(Some(request)) => {
                    if let Some(response) = self.handle_request(request).await {
                        if let Err(e) = outbound.send_response(&response) {
                            tracing::error!("Failed to send response: {}", e);
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("Client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read request: {}", e);
                    let error_response = Protocol::error_response(json!(null), JsonRpcError::parse_error());
                    let _ = outbound.send_response(&error_response);
                }
            }
        }

        for token in self.in_flight.lock().await.values() {
            token.cancel();
        }
        Ok(())
    }

    /// Answer a request inline, or `None` when there is nothing to send now
    /// (notifications, and tool calls answered by their own task)
    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!("Received request: method={}, id={:?}", request.method, request.id);

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id, request.params)),
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "tools/call" => self.handle_tools_call(request.id, request.params).await,
            "notifications/cancelled" => {
                self.handle_cancelled(request.params).await;
                None
            }
            _ if request.is_notification() => None,
            "ping" => Some(Protocol::success_response(request.id, json!({}))),
            _ => Some(Protocol::error_response(request.id, JsonRpcError::method_not_found())),
        }
    }

    fn handle_initialize(&self, id: Value, params: Value) -> JsonRpcResponse {
        match serde_json::from_value::<InitializeRequest>(params) {
            Ok(req) => tracing::info!(
                "Client connected: {} v{} (protocol {})",
                req.clientInfo.name,
                req.clientInfo.version,
                req.protocolVersion
            ),
            // Some clients send minimal initialize params
            Err(e) => tracing::warn!("Unrecognized initialize params: {}", e),
        }

        let response = InitializeResponse {
            protocolVersion: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    listChanged: Some(false),
                },
                logging: json!({}),
            },
            serverInfo: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: SERVER_VERSION.to_string(),
            },
        };

        Protocol::success_response(id, json!(response))
    }

    fn handle_tools_list(&self, id: Value) -> JsonRpcResponse {
        let response = ListToolsResponse { tools: tool_list() };
        Protocol::success_response(id, json!(response))
    }

    /// Validate the call, then run it on its own task so the request loop keeps
    /// reading (and can deliver cancellations) while it is in flight
    async fn handle_tools_call(&self, id: Value, params: Value) -> Option<JsonRpcResponse> {
        let call_request: CallToolRequest = match serde_json::from_value(params) {
            Ok(req) => req,
            Err(e) => {
                return Some(Protocol::error_response(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid params: {}", e)),
                ));
            }
        };
        if !AgentHandlers::is_operation(&call_request.name) {
            return Some(Protocol::error_response(
                id,
                JsonRpcError::internal_error(format!("Unknown tool: {}", call_request.name)),
            ));
        }

        let token = CancellationToken::new();
        let key = id.to_string();
        self.in_flight.lock().await.insert(key.clone(), token.clone());

        let handlers = self.handlers.clone();
        let in_flight = self.in_flight.clone();
        let outbound = self.protocol.outbound();
        tokio::spawn(async move {
            let response = run_call(handlers, outbound.clone(), call_request, token).await;
            in_flight.lock().await.remove(&key);
            if let Err(e) = outbound.send_response(&Protocol::success_response(id, json!(response))) {
                tracing::error!("Failed to send response: {}", e);
            }
        });
        None
    }

    async fn handle_cancelled(&self, params: Value) {
        let params: CancelledParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!("Ignoring malformed cancellation: {}", e);
                return;
            }
        };
        match self.in_flight.lock().await.get(&params.requestId.to_string()) {
            Some(token) => {
                tracing::info!(
                    "Cancelling request {} ({})",
                    params.requestId,
                    params.reason.as_deref().unwrap_or("no reason given")
                );
                token.cancel();
            }
            None => tracing::debug!("Cancellation for unknown request {}", params.requestId),
        }
    }
}

/// Run one tool call under the handler lock. Calls queue behind each other;
/// one cancelled while queued never starts.
async fn run_call(
    handlers: Arc<Mutex<AgentHandlers>>,
    outbound: Outbound,
    call: CallToolRequest,
    cancel: CancellationToken,
) -> CallToolResponse {
    let sink = McpEventSink::new(outbound);
    let mut handlers = handlers.lock().await;
    let result = if cancel.is_cancelled() {
        Err(AgentError::Cancelled.into())
    } else {
        handlers.call(&call.name, &call.arguments, &sink, &cancel).await
    };
    drop(handlers);

    match result {
        Ok(content) => CallToolResponse {
            content,
            isError: None,
        },
        Err(e) => {
            tracing::warn!("Tool {} failed: {:#}", call.name, e);
            CallToolResponse {
                content: vec![Content::Text {
                    text: format!("Error: {}", e),
                }],
                isError: Some(true),
            }
        }
    }
}

fn session_property() -> Value {
    json!({
        "type": "string",
        "description": "Session id (default: \"default\")"
    })
}

fn step_properties() -> Value {
    json!({
        "step": {"type": "number", "description": "1-based step number"},
        "index": {"type": "number", "description": "0-based step index (alternative to step)"}
    })
}

/// Build a tool whose schema also accepts `session`
fn tool(name: &str, description: &str, mut schema: Value) -> Tool {
    if let Some(props) = schema
        .get_mut("properties")
        .and_then(|p| p.as_object_mut())
    {
        props.insert("session".to_string(), session_property());
    }
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        inputSchema: schema,
    }
}

fn with_step(mut properties: Value) -> Value {
    if let (Some(props), Value::Object(step)) = (properties.as_object_mut(), step_properties()) {
        props.extend(step);
    }
    properties
}

fn tool_list() -> Vec<Tool> {
    vec![
        tool(
            "index_workspace",
            "Index the workspace into code chunks (with summaries and embeddings) for retrieval. Unchanged files are skipped.",
            json!({
                "type": "object",
                "properties": {
                    "include": {"type": "array", "items": {"type": "string"}, "description": "Include globs (default: all files)"},
                    "exclude": {"type": "array", "items": {"type": "string"}, "description": "Extra exclude globs"}
                }
            }),
        ),
        tool(
            "update_files",
            "Re-index specific files after they changed. Paths that no longer exist are removed from the index.",
            json!({
                "type": "object",
                "properties": {
                    "paths": {"type": "array", "items": {"type": "string"}, "description": "File paths, absolute or workspace-relative"}
                },
                "required": ["paths"]
            }),
        ),
        tool(
            "remove_file",
            "Remove a file's chunks from the index.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, absolute or workspace-relative"}
                },
                "required": ["path"]
            }),
        ),
        tool(
            "build_architecture_index",
            "Summarize every file and directory into the planner index used for planning.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "retrieve",
            "Retrieve the code chunks most relevant to a query (semantic similarity, literal identifiers, import expansion).",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Natural language query"},
                    "k": {"type": "number", "description": "Maximum number of results", "default": 8, "maximum": 50}
                },
                "required": ["query"]
            }),
        ),
        tool(
            "plan",
            "Turn a request into an ordered plan of tool steps. Replaces the session's current plan.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "What the user wants done"}
                },
                "required": ["query"]
            }),
        ),
        tool(
            "execute_step",
            "Execute one plan step.",
            json!({"type": "object", "properties": with_step(json!({}))}),
        ),
        tool(
            "execute_all",
            "Execute every plan step not yet executed, in order.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "insert_step",
            "Insert a step into the plan at a position (default: the end).",
            json!({
                "type": "object",
                "properties": with_step(json!({
                    "data": {"type": "object", "description": "The new step: action, thought, tool, args, ui_text"}
                })),
                "required": ["data"]
            }),
        ),
        tool(
            "delete_step",
            "Delete a plan step.",
            json!({"type": "object", "properties": with_step(json!({}))}),
        ),
        tool(
            "update_step",
            "Merge a patch into a plan step and mark it not executed.",
            json!({
                "type": "object",
                "properties": with_step(json!({
                    "patch": {"type": "object", "description": "Fields to replace; null removes a field"}
                })),
                "required": ["patch"]
            }),
        ),
        tool(
            "set_focus",
            "Tell the agent which file (and selection) the editor shows. Omit path to clear.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "number", "description": "1-based selection start"},
                    "end_line": {"type": "number", "description": "1-based selection end (inclusive)"}
                }
            }),
        ),
        tool(
            "get_status",
            "Index statistics and the session's plan, execution log and saved locations.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            "clear_session",
            "Reset a session: plan, execution log, memory and saved locations.",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}
