//! Tool registry: builtin tool definitions, the `tools.json` manifest, custom
//! tool entrypoints, and the dispatch boundary that turns tool failures into
//! result strings.

pub mod builtin;
pub mod custom;
pub mod edit;

use super::session::Session;
use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::host::EventSink;
use crate::indexer::architecture::PlannerIndex;
use crate::llm::Models;
use crate::planner::plan::{Args, Step};
use crate::retrieval::RetrievalEngine;
use crate::store::ChunkStore;
use anyhow::{Context, Result};
use custom::CustomToolRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;

/// Tool definition as listed to the model and stored in `tools.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub schema: Value,
    /// Registered function backing a custom tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

impl ToolDef {
    fn builtin(name: &str, description: &str, schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            entrypoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    pub builtin_tools: Vec<ToolDef>,
    #[serde(default)]
    pub custom_tools: Vec<ToolDef>,
}

/// Everything a tool may touch besides the session
pub struct ToolContext<'a> {
    pub config: &'a Config,
    pub models: &'a Models,
    pub store: &'a ChunkStore,
    pub retrieval: &'a RetrievalEngine,
    pub planner_index: &'a PlannerIndex,
    pub sink: &'a dyn EventSink,
    pub cancel: Option<&'a CancellationToken>,
}

impl ToolContext<'_> {
    pub fn root(&self) -> &Path {
        &self.config.workspace_root
    }
}

pub struct ToolRegistry {
    defs: Vec<ToolDef>,
    custom: CustomToolRegistry,
}

impl ToolRegistry {
    /// Builtins plus every manifest custom tool whose entrypoint is registered
    pub fn new(custom_defs: Vec<ToolDef>, custom: CustomToolRegistry) -> Self {
        let mut defs = builtin_tool_defs();
        for def in custom_defs {
            if defs.iter().any(|d| d.name == def.name) {
                tracing::warn!("Custom tool {} shadows an existing tool, skipping", def.name);
                continue;
            }
            match def.entrypoint.as_deref() {
                Some(entry) if custom.contains(entry) => defs.push(def),
                other => tracing::warn!(
                    "Custom tool {} has unknown entrypoint {:?}, skipping",
                    def.name,
                    other
                ),
            }
        }
        Self { defs, custom }
    }

    /// Read `tools.json`, creating it with the builtin definitions when absent
    pub async fn load(path: &Path, custom: CustomToolRegistry) -> Result<Self> {
        let manifest = if path.exists() {
            let raw = fs::read_to_string(path).await?;
            serde_json::from_str::<ToolManifest>(&raw)
                .with_context(|| format!("Invalid tool manifest: {}", path.display()))?
        } else {
            let manifest = ToolManifest {
                builtin_tools: builtin_tool_defs(),
                custom_tools: Vec::new(),
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(path, serde_json::to_string_pretty(&manifest)?).await?;
            tracing::info!("Created tool manifest at {}", path.display());
            manifest
        };
        Ok(Self::new(manifest.custom_tools, custom))
    }

    pub fn defs(&self) -> &[ToolDef] {
        &self.defs
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Run a tool. Tool failures come back as `Ok("Error: …")`; only provider
    /// failures and cancellation are returned as errors.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Args,
        step: &Step,
        ctx: &ToolContext<'_>,
        session: &mut Session,
    ) -> AgentResult<String> {
        let result = match self.get(name) {
            Some(ToolDef {
                entrypoint: Some(entry),
                ..
            }) => self.custom.run(entry, ctx.root(), args).await,
            Some(_) => builtin::run(name, args, step, ctx, session).await,
            None => Err(anyhow::anyhow!("Unknown tool: {}", name)),
        };

        match result {
            Ok(text) => Ok(text),
            Err(e) => match e.downcast::<AgentError>() {
                Ok(err @ (AgentError::Provider(_) | AgentError::Cancelled)) => Err(err),
                Ok(other) => Ok(format!("Error: {}", other)),
                Err(e) => Ok(format!("Error: {:#}", e)),
            },
        }
    }
}

/// Absolute paths pass through; relative ones are joined to the workspace root
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path.trim());
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p.strip_prefix("./").unwrap_or(p))
    }
}

/// Workspace-relative display form of a path
pub fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

/// First string argument present under any of `keys`
pub fn str_arg<'a>(args: &'a Args, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

pub fn require_str<'a>(args: &'a Args, keys: &[&str]) -> Result<&'a str> {
    str_arg(args, keys).with_context(|| format!("Missing '{}' argument", keys[0]))
}

/// Unsigned integer argument, accepting numbers and numeric strings
pub fn usize_arg(args: &Args, keys: &[&str]) -> Option<usize> {
    keys.iter().find_map(|k| match args.get(*k)? {
        Value::Number(n) => n.as_u64().map(|v| v as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn bool_arg(args: &Args, key: &str) -> Option<bool> {
    match args.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": description}
        },
        "required": ["path"]
    })
}

fn search_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "description": "Natural language query"},
            "k": {"type": "number", "description": "Maximum number of results", "default": 8}
        },
        "required": ["query"]
    })
}

pub fn builtin_tool_defs() -> Vec<ToolDef> {
    vec![
        ToolDef::builtin(
            "check_exists",
            "Check whether a file or directory exists and show its architecture summary.",
            path_schema("File or directory path"),
        ),
        ToolDef::builtin(
            "search_code",
            "Semantic search over the indexed codebase; lists matching code units.",
            search_schema(),
        ),
        ToolDef::builtin(
            "locate_code",
            "Find a function, class or pattern and save its enclosing block as a named location for later edits.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File to search (optional)"},
                    "name": {"type": "string", "description": "Symbol name"},
                    "pattern": {"type": "string", "description": "Regex or literal text"},
                    "save_as": {"type": "string", "description": "Name for the saved location"}
                }
            }),
        ),
        ToolDef::builtin(
            "retrieve_chunks",
            "Retrieve relevant code chunks (with content) for a query and keep them as edit context.",
            search_schema(),
        ),
        ToolDef::builtin(
            "create_file",
            "Create a new file. Describe the contents in content_spec; the code is generated when the step runs.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content_spec": {"type": "string", "description": "What the file should contain, in natural language"},
                    "overwrite": {"type": "boolean", "default": false}
                },
                "required": ["path", "content_spec"]
            }),
        ),
        ToolDef::builtin(
            "edit_file",
            "Edit part of a file. The target range comes from explicit start/end lines, a saved location, retrieved chunks or the editor selection.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "edit_spec": {"type": "string", "description": "The change to make, in natural language"},
                    "location": {"type": "string", "description": "Name of a saved location"},
                    "start_line": {"type": "number"},
                    "end_line": {"type": "number"}
                },
                "required": ["path", "edit_spec"]
            }),
        ),
        ToolDef::builtin(
            "append_file",
            "Append generated content to the end of a file.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content_spec": {"type": "string"}
                },
                "required": ["path", "content_spec"]
            }),
        ),
        ToolDef::builtin(
            "read_file",
            "Read a file (optionally a line range) and save it as a named location.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "number"},
                    "end_line": {"type": "number"},
                    "save_as": {"type": "string"}
                },
                "required": ["path"]
            }),
        ),
        ToolDef::builtin(
            "list_directory",
            "List the entries of a directory.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "default": "."}}
            }),
        ),
        ToolDef::builtin("delete_path", "Delete a file or directory.", path_schema("Path to delete")),
        ToolDef::builtin(
            "move_path",
            "Move or rename a file or directory.",
            json!({
                "type": "object",
                "properties": {"from": {"type": "string"}, "to": {"type": "string"}},
                "required": ["from", "to"]
            }),
        ),
        ToolDef::builtin(
            "copy_path",
            "Copy a file or directory.",
            json!({
                "type": "object",
                "properties": {"from": {"type": "string"}, "to": {"type": "string"}},
                "required": ["from", "to"]
            }),
        ),
        ToolDef::builtin(
            "create_directory",
            "Create a directory and any missing parents.",
            path_schema("Directory to create"),
        ),
        ToolDef::builtin(
            "search_text",
            "Plain-text search across workspace files.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "path": {"type": "string", "description": "File or directory to limit the search to"},
                    "max_results": {"type": "number", "default": 50}
                },
                "required": ["query"]
            }),
        ),
        ToolDef::builtin(
            "search_regex",
            "Regular-expression search across workspace files.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                    "max_results": {"type": "number", "default": 50}
                },
                "required": ["pattern"]
            }),
        ),
        ToolDef::builtin(
            "replace_in_file",
            "Replace text in a file. Give find/replace literally, or describe them in find_spec/replace_spec.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "find_spec": {"type": "string"},
                    "replace_spec": {"type": "string"},
                    "regex": {"type": "boolean", "default": false},
                    "all": {"type": "boolean", "default": true}
                },
                "required": ["path"]
            }),
        ),
        ToolDef::builtin(
            "update_json",
            "Set a value at a dotted key path in a JSON file (e.g. scripts.build).",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "json_path": {"type": "string"},
                    "value": {}
                },
                "required": ["path", "json_path", "value"]
            }),
        ),
        ToolDef::builtin(
            "run_command",
            "Run an allow-listed shell command in the workspace root.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_secs": {"type": "number"}
                },
                "required": ["command"]
            }),
        ),
        ToolDef::builtin("format_file", "Run the configured formatter on a file.", path_schema("File to format")),
        ToolDef::builtin(
            "focus_editor",
            "Open a file in the editor, optionally selecting a line range.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "number"},
                    "end_line": {"type": "number"}
                },
                "required": ["path"]
            }),
        ),
    ]
}
