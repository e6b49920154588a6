use crate::config::Config;
use crate::executor::session::Session;
use crate::executor::tools::builtin::format_results;
use crate::executor::tools::ToolRegistry;
use crate::executor::{ExecutionEnv, Executor};
use crate::host::{EditorFocus, EventSink};
use crate::indexer::architecture::ArchitectureIndexer;
use crate::indexer::{collect_files, Indexer};
use crate::llm::Models;
use crate::mcp::types::Content;
use crate::planner::plan::{Plan, Step};
use crate::planner::{PlanOptions, Planner};
use crate::retrieval::rerank::Reranker;
use crate::retrieval::RetrievalEngine;
use crate::store::ChunkStore;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_SESSION: &str = "default";

/// Agent operations exposed through `tools/call`
pub const OPERATIONS: &[&str] = &[
    "index_workspace",
    "update_files",
    "remove_file",
    "build_architecture_index",
    "retrieve",
    "plan",
    "execute_step",
    "execute_all",
    "insert_step",
    "delete_step",
    "update_step",
    "set_focus",
    "get_status",
    "clear_session",
];

/// Tool handlers for the MCP server: one per agent operation, plus the
/// session table they share
pub struct AgentHandlers {
    config: Arc<Config>,
    store: Arc<ChunkStore>,
    indexer: Indexer,
    architecture: ArchitectureIndexer,
    retrieval: Arc<RetrievalEngine>,
    planner: Planner,
    executor: Executor,
    sessions: HashMap<String, Session>,
}

impl AgentHandlers {
    pub fn new(
        config: Arc<Config>,
        models: Models,
        store: Arc<ChunkStore>,
        reranker: Option<Arc<dyn Reranker>>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let retrieval = Arc::new(RetrievalEngine::new(store.clone(), models.clone(), reranker));
        Self {
            indexer: Indexer::new(config.clone(), models.clone(), store.clone()),
            architecture: ArchitectureIndexer::new(config.clone(), models.clone()),
            planner: Planner::new(config.clone(), models.clone()),
            executor: Executor::new(config.clone(), models, store.clone(), retrieval.clone(), tools),
            retrieval,
            store,
            config,
            sessions: HashMap::new(),
        }
    }

    /// Load persisted state (chunk store, planner index)
    pub async fn load(&self) -> Result<()> {
        self.store.load().await?;
        self.architecture.load().await?;
        Ok(())
    }

    pub fn is_operation(name: &str) -> bool {
        OPERATIONS.contains(&name)
    }

    /// Route one `tools/call` to its handler
    pub async fn call(
        &mut self,
        name: &str,
        args: &Value,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<Content>> {
        let text = match name {
            "index_workspace" => self.handle_index_workspace(args, sink).await?,
            "update_files" => self.handle_update_files(args).await?,
            "remove_file" => self.handle_remove_file(args).await?,
            "build_architecture_index" => self.handle_build_architecture_index(sink).await?,
            "retrieve" => self.handle_retrieve(args, sink).await?,
            "plan" => self.handle_plan(args, sink, cancel).await?,
            "execute_step" => self.handle_execute_step(args, sink, cancel).await?,
            "execute_all" => self.handle_execute_all(args, sink, cancel).await?,
            "insert_step" => self.handle_insert_step(args)?,
            "delete_step" => self.handle_delete_step(args)?,
            "update_step" => self.handle_update_step(args)?,
            "set_focus" => self.handle_set_focus(args)?,
            "get_status" => self.handle_get_status(args).await?,
            "clear_session" => self.handle_clear_session(args),
            _ => anyhow::bail!("Unknown tool: {}", name),
        };
        Ok(vec![Content::Text { text }])
    }

    /// Handle index_workspace tool
    async fn handle_index_workspace(&self, args: &Value, sink: &dyn EventSink) -> Result<String> {
        let include = string_list(args, "include").unwrap_or_else(|| self.config.include_globs.clone());
        let exclude = string_list(args, "exclude").unwrap_or_else(|| self.config.exclude_globs.clone());

        let report = self.indexer.index_workspace(&include, &exclude, sink).await?;
        let (chunks, embedded, files) = self.store.stats().await;
        Ok(format!(
            "Indexed {} files ({} chunks), skipped {}, failed {}\nStore: {} chunks ({} embedded) across {} files",
            report.files_indexed,
            report.chunks,
            report.files_skipped,
            report.files_failed,
            chunks,
            embedded,
            files
        ))
    }

    /// Handle update_files tool
    async fn handle_update_files(&self, args: &Value) -> Result<String> {
        let paths: Vec<PathBuf> = string_list(args, "paths")
            .context("Missing 'paths' argument")?
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let report = self.indexer.update_for_files(&paths).await?;
        self.refresh_architecture(&paths).await;
        Ok(format!(
            "Re-indexed {} files ({} chunks), skipped {}, failed {}",
            report.files_indexed, report.chunks, report.files_skipped, report.files_failed
        ))
    }

    /// Handle remove_file tool
    async fn handle_remove_file(&self, args: &Value) -> Result<String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .context("Missing 'path' argument")?;
        let removed = self.indexer.remove_file(Path::new(path)).await?;
        if !self.architecture.snapshot().await.is_empty() {
            self.architecture.update_for_removed(Path::new(path)).await?;
        }
        Ok(format!("Removed {} chunks of {}", removed, path))
    }

    /// Handle build_architecture_index tool
    async fn handle_build_architecture_index(&self, sink: &dyn EventSink) -> Result<String> {
        let index = self.architecture.build_index(sink).await?;
        Ok(format!("Built planner index with {} entries", index.len()))
    }

    /// Handle retrieve tool
    async fn handle_retrieve(&mut self, args: &Value, sink: &dyn EventSink) -> Result<String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .context("Missing 'query' argument")?;
        let k = args
            .get("k")
            .or_else(|| args.get("limit"))
            .and_then(|v| v.as_u64())
            .map(|k| k as usize)
            .unwrap_or(self.config.retrieval_top_k)
            .max(1);

        let results = self.retrieval.retrieve(query, k).await;
        sink.post_message(
            "chunks",
            json!(results
                .iter()
                .map(|r| json!({
                    "path": r.chunk.file_path,
                    "name": r.chunk.name,
                    "startLine": r.chunk.start_line,
                    "endLine": r.chunk.end_line,
                    "score": r.score,
                }))
                .collect::<Vec<_>>()),
        );
        if results.is_empty() {
            return Ok("No results found.".to_string());
        }

        let text = format_results(&self.config.workspace_root, &results, true);
        session_entry(&mut self.sessions, args).retrieved = results;
        Ok(text)
    }

    /// Handle plan tool
    async fn handle_plan(
        &mut self,
        args: &Value,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .context("Missing 'query' argument")?
            .to_string();
        let index = self.architecture.snapshot().await;
        let session = session_entry(&mut self.sessions, args);

        let memory = session.memory_text();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let options = PlanOptions {
            memory: Some(memory.as_str()).filter(|m| !m.is_empty()),
            previous_plan: Some(&session.plan).filter(|p| !p.is_empty()),
            completed: Some(&session.executed),
            ui_text: Some(tx),
            cancel: Some(cancel),
        };
        let planning = self
            .planner
            .run_planner(&query, &index, self.executor.tools().defs(), options);
        let forward = async {
            while let Some(text) = rx.recv().await {
                sink.post_message("ui_text", json!({ "text": text }));
            }
        };
        let (plan, ()) = tokio::join!(planning, forward);
        let plan = plan?;

        sink.post_message("plan", json!(plan));
        let text = describe_plan(&plan);
        session.install_plan(plan);
        session.memory.push(format!("User asked: {}", query));
        Ok(text)
    }

    /// Handle execute_step tool
    async fn handle_execute_step(
        &mut self,
        args: &Value,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let index = step_index(args)?;
        let planner_index = self.architecture.snapshot().await;
        let session = session_entry(&mut self.sessions, args);
        let env = ExecutionEnv {
            planner_index: &planner_index,
            sink,
            cancel: Some(cancel),
        };

        let result = self.executor.execute_step(session, index, &env).await;
        let touched = session.take_touched();
        self.reindex_touched(touched).await;
        Ok(format!("Step {}: {}", index + 1, result?))
    }

    /// Handle execute_all tool
    async fn handle_execute_all(
        &mut self,
        args: &Value,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let planner_index = self.architecture.snapshot().await;
        let session = session_entry(&mut self.sessions, args);
        if session.plan.is_empty() {
            anyhow::bail!("No plan to execute. Call plan first.");
        }
        let env = ExecutionEnv {
            planner_index: &planner_index,
            sink,
            cancel: Some(cancel),
        };

        let result = self.executor.execute_all(session, &env).await;
        let touched = session.take_touched();
        self.reindex_touched(touched).await;

        let results = result?;
        if results.is_empty() {
            return Ok("All steps already executed.".to_string());
        }
        Ok(results
            .iter()
            .map(|(i, text)| format!("Step {}: {}", i + 1, text))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    /// Handle insert_step tool
    fn handle_insert_step(&mut self, args: &Value) -> Result<String> {
        let mut data = args
            .get("data")
            .and_then(|v| v.as_object())
            .cloned()
            .context("Missing 'data' argument (the new step)")?;
        data.entry("step").or_insert(json!(0));
        data.entry("thought").or_insert(json!(""));
        let step: Step = serde_json::from_value(Value::Object(data)).context("Invalid step")?;

        let session = session_entry(&mut self.sessions, args);
        let index = match step_index(args) {
            Ok(index) => index,
            Err(_) => session.plan.len(),
        };
        self.executor.insert_step(session, index, step)?;
        Ok(format!("Inserted step {}\n\n{}", index + 1, describe_plan(&session.plan)))
    }

    /// Handle delete_step tool
    fn handle_delete_step(&mut self, args: &Value) -> Result<String> {
        let index = step_index(args)?;
        let session = session_entry(&mut self.sessions, args);
        let removed = self.executor.delete_step(session, index)?;
        Ok(format!(
            "Deleted step {}: {}\n\n{}",
            index + 1,
            removed.action,
            describe_plan(&session.plan)
        ))
    }

    /// Handle update_step tool
    fn handle_update_step(&mut self, args: &Value) -> Result<String> {
        let index = step_index(args)?;
        let patch = args
            .get("patch")
            .and_then(|v| v.as_object())
            .cloned()
            .context("Missing 'patch' argument")?;
        let session = session_entry(&mut self.sessions, args);
        let step = self.executor.update_step(session, index, &patch)?;
        Ok(format!("Updated step {}: {}", step.step, step.action))
    }

    /// Handle set_focus tool
    fn handle_set_focus(&mut self, args: &Value) -> Result<String> {
        let path = args.get("path").and_then(|v| v.as_str()).filter(|p| !p.is_empty());
        let focus = match path {
            Some(path) => Some(EditorFocus {
                path: self
                    .config
                    .workspace_root
                    .join(path)
                    .to_string_lossy()
                    .to_string(),
                start_line: args.get("start_line").and_then(|v| v.as_u64()).map(|n| n as usize),
                end_line: args.get("end_line").and_then(|v| v.as_u64()).map(|n| n as usize),
            }),
            None => None,
        };
        let text = match &focus {
            Some(f) => format!("Focus set to {}", f.path),
            None => "Focus cleared".to_string(),
        };
        session_entry(&mut self.sessions, args).focus = focus;
        Ok(text)
    }

    /// Handle get_status tool
    async fn handle_get_status(&mut self, args: &Value) -> Result<String> {
        let (chunks, embedded, files) = self.store.stats().await;
        let planner_entries = self.architecture.snapshot().await.len();
        let session = session_entry(&mut self.sessions, args);

        let steps: Vec<Value> = session
            .plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                json!({
                    "step": step.step,
                    "action": step.action,
                    "tool": step.tool,
                    "executed": session.executed.contains(&i),
                })
            })
            .collect();
        let status = json!({
            "workspace": self.config.workspace_root,
            "index": {
                "chunks": chunks,
                "embedded": embedded,
                "files": files,
                "planner_entries": planner_entries,
            },
            "session": {
                "id": session.id,
                "steps": steps,
                "complete": session.is_complete(),
                "records": session.records,
                "saved_locations": session.saved_locations,
                "retrieved": session.retrieved.len(),
                "memory": session.memory.len(),
                "focus": session.focus,
            },
        });
        Ok(serde_json::to_string_pretty(&status)?)
    }

    /// Handle clear_session tool
    fn handle_clear_session(&mut self, args: &Value) -> String {
        let id = session_id(args);
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.clear();
                format!("Cleared session {}", id)
            }
            None => format!("No session named {}", id),
        }
    }

    /// Re-index files the executor touched. Directories expand to their files;
    /// vanished paths drop every chunk stored under them.
    async fn reindex_touched(&self, touched: Vec<String>) {
        if touched.is_empty() {
            return;
        }
        let touched: Vec<PathBuf> = touched.into_iter().map(PathBuf::from).collect();
        let indexed = self.store.indexed_files().await;

        let mut files = Vec::new();
        for path in &touched {
            if path.is_dir() {
                match collect_files(path, &[], &[]) {
                    Ok(found) => files.extend(found),
                    Err(e) => tracing::warn!("Failed to walk {}: {}", path.display(), e),
                }
            } else if path.exists() {
                files.push(path.clone());
            } else {
                files.extend(
                    indexed
                        .iter()
                        .filter(|f| Path::new(f.as_str()).starts_with(path))
                        .map(PathBuf::from),
                );
            }
        }
        files.sort();
        files.dedup();

        match self.indexer.update_for_files(&files).await {
            Ok(report) => tracing::debug!("Re-indexed {} touched files", report.files_indexed),
            Err(e) => tracing::warn!("Failed to re-index touched files: {}", e),
        }
        self.refresh_architecture(&touched).await;
    }

    /// Keep an existing planner index current; never builds one implicitly
    async fn refresh_architecture(&self, paths: &[PathBuf]) {
        if self.architecture.snapshot().await.is_empty() {
            return;
        }
        for path in paths {
            let path = self.config.workspace_root.join(path);
            let result = if path.is_file() {
                self.architecture.update_for_added(&path).await
            } else if !path.exists() {
                self.architecture.update_for_removed(&path).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                tracing::warn!("Failed to update planner index for {}: {}", path.display(), e);
            }
        }
    }
}

/// Session named by `args.session`, created on first use
fn session_entry<'a>(sessions: &'a mut HashMap<String, Session>, args: &Value) -> &'a mut Session {
    let id = session_id(args);
    sessions.entry(id.clone()).or_insert_with(|| Session::new(id))
}

fn session_id(args: &Value) -> String {
    args.get("session")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION)
        .to_string()
}

/// `index` is 0-based, `step` is 1-based
fn step_index(args: &Value) -> Result<usize> {
    if let Some(index) = args.get("index").and_then(|v| v.as_u64()) {
        return Ok(index as usize);
    }
    match args.get("step").and_then(|v| v.as_u64()) {
        Some(0) => anyhow::bail!("Step numbers start at 1"),
        Some(step) => Ok(step as usize - 1),
        None => anyhow::bail!("Missing 'step' (1-based) or 'index' (0-based) argument"),
    }
}

fn string_list(args: &Value, key: &str) -> Option<Vec<String>> {
    match args.get(key)? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
        ),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn describe_plan(plan: &Plan) -> String {
    let mut text = format!("Plan ({} steps):\n", plan.len());
    for step in &plan.steps {
        text.push_str(&format!("{}. {}", step.step, step.action));
        if let Some(tool) = &step.tool {
            text.push_str(&format!(" [{}]", tool));
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tools::custom::CustomToolRegistry;
    use crate::host::testing::RecordingSink;
    use crate::testing::{models, StubModel};
    use tempfile::TempDir;

    const PLAN_REPLY: &str = r#"{"steps": [
        {"step": 1, "action": "Create the notes file", "thought": "Requested", "ui_text": "Creating notes", "tool": "create_file", "args": {"path": "notes.md", "content_spec": "A greeting"}},
        {"step": 2, "action": "List the workspace", "thought": "Check", "ui_text": "Listing", "tool": "list_directory", "args": {"path": "."}}
    ]}"#;

    fn handlers(dir: &TempDir, chat: StubModel) -> AgentHandlers {
        let mut config = Config::for_workspace(dir.path());
        config.summarize_chunks = false;
        let config = Arc::new(config);
        let (models, _) = models(chat, None);
        let store = Arc::new(ChunkStore::new(config.chunks_path()));
        let tools = Arc::new(ToolRegistry::new(Vec::new(), CustomToolRegistry::with_defaults()));
        AgentHandlers::new(config, models, store, None, tools)
    }

    fn text(content: Vec<Content>) -> String {
        match content.into_iter().next() {
            Some(Content::Text { text }) => text,
            None => String::new(),
        }
    }

    #[test]
    fn test_step_index_arguments() {
        assert_eq!(step_index(&json!({"step": 2})).unwrap(), 1);
        assert_eq!(step_index(&json!({"index": 0, "step": 9})).unwrap(), 0);
        assert!(step_index(&json!({"step": 0})).is_err());
        assert!(step_index(&json!({})).is_err());
        assert_eq!(session_id(&json!({})), "default");
        assert_eq!(session_id(&json!({"session": "chat-2"})), "chat-2");
    }

    #[tokio::test]
    async fn test_plan_then_execute_all_reindexes_created_file() {
        let dir = TempDir::new().unwrap();
        let mut handlers = handlers(&dir, StubModel::new(&[PLAN_REPLY, "hello"]).with_fallback("Created notes."));
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        let planned = text(
            handlers
                .call("plan", &json!({"query": "add a notes file"}), &sink, &cancel)
                .await
                .unwrap(),
        );
        assert!(planned.starts_with("Plan (2 steps):"));
        assert_eq!(
            sink.payloads("ui_text"),
            vec![json!({"text": "Creating notes"}), json!({"text": "Listing"})]
        );

        let ran = text(
            handlers
                .call("execute_all", &json!({}), &sink, &cancel)
                .await
                .unwrap(),
        );
        assert!(ran.contains("Step 1: Created notes.md"));
        assert!(ran.contains("notes.md"));

        let notes = dir.path().join("notes.md");
        assert_eq!(std::fs::read_to_string(&notes).unwrap(), "hello\n");
        let indexed = handlers.store.indexed_files().await;
        assert_eq!(indexed, vec![notes.to_string_lossy().to_string()]);

        let session = &handlers.sessions["default"];
        assert!(session.is_complete());
        assert_eq!(
            session.memory,
            vec!["User asked: add a notes file".to_string(), "Created notes.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_step_editing_operations() {
        let dir = TempDir::new().unwrap();
        let mut handlers = handlers(&dir, StubModel::new(&[PLAN_REPLY]));
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        handlers
            .call("plan", &json!({"query": "notes", "session": "s"}), &sink, &cancel)
            .await
            .unwrap();

        handlers
            .call(
                "insert_step",
                &json!({"session": "s", "step": 1, "data": {"action": "Look first", "tool": "list_directory", "args": {"path": "."}}}),
                &sink,
                &cancel,
            )
            .await
            .unwrap();
        handlers
            .call("delete_step", &json!({"session": "s", "step": 3}), &sink, &cancel)
            .await
            .unwrap();
        handlers
            .call(
                "update_step",
                &json!({"session": "s", "index": 1, "patch": {"action": "Create the notes file quickly"}}),
                &sink,
                &cancel,
            )
            .await
            .unwrap();

        let plan = &handlers.sessions["s"].plan;
        let actions: Vec<&str> = plan.steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, vec!["Look first", "Create the notes file quickly"]);
        assert_eq!(plan.steps[1].step, 2);
        assert!(!handlers.sessions.contains_key("default"));

        let cleared = text(
            handlers
                .call("clear_session", &json!({"session": "s"}), &sink, &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(cleared, "Cleared session s");
        assert!(handlers.sessions["s"].plan.is_empty());
    }

    #[tokio::test]
    async fn test_client_steps_cannot_smuggle_literal_code() {
        let dir = TempDir::new().unwrap();
        let mut handlers = handlers(&dir, StubModel::new(&[PLAN_REPLY]));
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        handlers
            .call("plan", &json!({"query": "notes"}), &sink, &cancel)
            .await
            .unwrap();

        handlers
            .call(
                "insert_step",
                &json!({"data": {"action": "Write the script", "tool": "create_file",
                    "args": {"path": "run.sh", "content": "rm -rf ~;\necho done"}}}),
                &sink,
                &cancel,
            )
            .await
            .unwrap();
        handlers
            .call(
                "update_step",
                &json!({"step": 1, "patch": {"tool": "auto", "args": {"path": "notes.md", "code": "const a = 1;"}}}),
                &sink,
                &cancel,
            )
            .await
            .unwrap();

        let plan = &handlers.sessions["default"].plan;
        let inserted = plan.steps.last().unwrap().args.as_ref().unwrap();
        assert!(inserted.get("content").is_none());
        assert!(inserted.get("content_spec").is_none());
        let patched = plan.steps[0].args.as_ref().unwrap();
        assert!(patched.get("code").is_none());
        assert!(patched.get("code_spec").is_none());
        assert_eq!(patched["path"], "notes.md");
    }

    #[tokio::test]
    async fn test_unknown_operation_and_missing_plan() {
        let dir = TempDir::new().unwrap();
        let mut handlers = handlers(&dir, StubModel::new(&[]));
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        assert!(!AgentHandlers::is_operation("index_codebase"));
        assert!(handlers.call("index_codebase", &json!({}), &sink, &cancel).await.is_err());
        let err = handlers
            .call("execute_all", &json!({}), &sink, &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No plan"));
    }
}
