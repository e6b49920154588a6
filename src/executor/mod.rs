//! Plan execution: tool resolution, dispatch, execution log and the
//! completion recap.
//!
//! Steps run strictly one at a time. Later steps read what earlier ones left
//! in the session (saved locations, retrieved chunks, tool output summaries).

pub mod range;
pub mod selection;
pub mod session;
pub mod tools;

use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::host::EventSink;
use crate::indexer::architecture::PlannerIndex;
use crate::llm::{ChatMessage, Models};
use crate::parser::truncate_chars;
use crate::planner::plan::{Args, Step};
use crate::retrieval::RetrievalEngine;
use crate::store::ChunkStore;
use selection::{
    describe, heuristic_args, heuristic_tool, parse_selection, selection_prompt, Selection, SelectionMode,
};
use serde_json::json;
use session::{ExecutionRecord, Session};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tools::{ToolContext, ToolDef, ToolRegistry};

/// Per-call environment supplied by the host
pub struct ExecutionEnv<'a> {
    pub planner_index: &'a PlannerIndex,
    pub sink: &'a dyn EventSink,
    pub cancel: Option<&'a CancellationToken>,
}

impl ExecutionEnv<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.map_or(false, |c| c.is_cancelled())
    }
}

pub struct Executor {
    config: Arc<Config>,
    models: Models,
    store: Arc<ChunkStore>,
    retrieval: Arc<RetrievalEngine>,
    tools: Arc<ToolRegistry>,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        models: Models,
        store: Arc<ChunkStore>,
        retrieval: Arc<RetrievalEngine>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            config,
            models,
            store,
            retrieval,
            tools,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Execute the step at 0-based `index`.
    ///
    /// Tool failures come back as an `Error: …` result. Resolution and provider
    /// failures are logged on the step and returned; the step still counts as
    /// executed. Cancellation leaves no trace.
    pub async fn execute_step(
        &self,
        session: &mut Session,
        index: usize,
        env: &ExecutionEnv<'_>,
    ) -> AgentResult<String> {
        let step = session.plan.steps.get(index).cloned().ok_or_else(|| {
            AgentError::invalid_request(format!(
                "Step index {} out of range (plan has {} steps)",
                index,
                session.plan.len()
            ))
        })?;
        if env.cancelled() {
            return Err(AgentError::Cancelled);
        }

        env.sink.post_message(
            "step_started",
            json!({
                "index": index,
                "step": step.step,
                "action": step.action,
                "ui_text": step.ui_text,
            }),
        );
        let started = Instant::now();

        let ctx = ToolContext {
            config: &self.config,
            models: &self.models,
            store: &self.store,
            retrieval: &self.retrieval,
            planner_index: env.planner_index,
            sink: env.sink,
            cancel: env.cancel,
        };
        let outcome = match self.resolve_tool(&step, session, env.cancel).await {
            Ok((tool, args)) => {
                tracing::info!("Step {}: {}", step.step, describe(&tool, &args));
                self.tools
                    .dispatch(&tool, &args, &step, &ctx, session)
                    .await
                    .map(|text| (tool, text))
            }
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(AgentError::Cancelled) => {
                tracing::info!("Step {} cancelled", step.step);
                return Err(AgentError::Cancelled);
            }
            Ok((tool, text)) => {
                let error = text.starts_with("Error:").then(|| text.clone());
                self.log_step(session, index, &step, Some(tool), elapsed_ms, text.clone(), error, env);
                Ok(text)
            }
            Err(err) => {
                tracing::warn!("Step {} failed: {}", step.step, err);
                let message = err.to_string();
                self.log_step(session, index, &step, None, elapsed_ms, message.clone(), Some(message), env);
                Err(err)
            }
        };

        self.summarize_if_complete(session, env).await;
        result
    }

    /// Run every not-yet-executed step in order. A step whose tool cannot be
    /// resolved is logged and skipped; provider failures and cancellation stop
    /// the run.
    pub async fn execute_all(
        &self,
        session: &mut Session,
        env: &ExecutionEnv<'_>,
    ) -> AgentResult<Vec<(usize, String)>> {
        let mut results = Vec::new();
        for index in session.pending() {
            if env.cancelled() {
                return Err(AgentError::Cancelled);
            }
            match self.execute_step(session, index, env).await {
                Ok(text) => results.push((index, text)),
                Err(err @ AgentError::ToolResolution { .. }) => results.push((index, err.to_string())),
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    pub fn insert_step(&self, session: &mut Session, index: usize, step: Step) -> AgentResult<()> {
        session.plan.insert_step(&mut session.executed, index, step)?;
        session.summarized = false;
        Ok(())
    }

    pub fn delete_step(&self, session: &mut Session, index: usize) -> AgentResult<Step> {
        session.plan.delete_step(&mut session.executed, index)
    }

    pub fn update_step(&self, session: &mut Session, index: usize, patch: &Args) -> AgentResult<Step> {
        let step = session
            .plan
            .update_step(&mut session.executed, index, patch)?
            .clone();
        session.summarized = false;
        Ok(step)
    }

    #[allow(clippy::too_many_arguments)]
    fn log_step(
        &self,
        session: &mut Session,
        index: usize,
        step: &Step,
        tool: Option<String>,
        elapsed_ms: u64,
        result: String,
        error: Option<String>,
        env: &ExecutionEnv<'_>,
    ) {
        let first_line = result.lines().next().unwrap_or_default();
        session.record_output(format!(
            "step {} ({}): {}",
            step.step,
            tool.as_deref().unwrap_or("unresolved"),
            truncate_chars(first_line, 200)
        ));
        env.sink.post_message(
            "step_completed",
            json!({
                "index": index,
                "step": step.step,
                "tool": tool,
                "result": truncate_chars(&result, 4000),
                "error": error,
                "elapsed_ms": elapsed_ms,
            }),
        );
        session.records.push(ExecutionRecord {
            step: step.step,
            label: step.ui_text.clone().unwrap_or_else(|| step.action.clone()),
            tool,
            elapsed_ms,
            result,
            error,
        });
        session.executed.insert(index);
    }

    async fn resolve_tool(
        &self,
        step: &Step,
        session: &Session,
        cancel: Option<&CancellationToken>,
    ) -> AgentResult<(String, Args)> {
        let (tool, args) = step.tool_call();
        match tool {
            Some(tool) if self.tools.is_known(&tool) => match args {
                Some(args) => Ok((tool, args)),
                None => {
                    let defs: Vec<ToolDef> = self.tools.get(&tool).cloned().into_iter().collect();
                    let args = match self.select(step, session, SelectionMode::ArgsOnly, &defs, cancel).await? {
                        Some(selection) if !selection.args.is_empty() => selection.args,
                        _ => heuristic_args(&tool, step),
                    };
                    Ok((tool, args))
                }
            },
            other => {
                if let Some(unknown) = other {
                    tracing::warn!("Step {} names unknown tool {}", step.step, unknown);
                }
                let selection = self
                    .select(step, session, SelectionMode::Auto, self.tools.defs(), cancel)
                    .await?;
                if let Some(Selection { tool: Some(name), args: selected }) = selection {
                    if self.tools.is_known(&name) {
                        let mut merged = args.unwrap_or_default();
                        merged.extend(selected);
                        return Ok((name, merged));
                    }
                    tracing::debug!("Model selected unknown tool {}", name);
                }
                heuristic_tool(step)
                    .filter(|(name, _)| self.tools.is_known(name))
                    .ok_or_else(|| AgentError::ToolResolution {
                        step: step.step,
                        reason: "the model named no known tool and no keyword matched".to_string(),
                    })
            }
        }
    }

    /// One tool-selection round trip. Provider failures fall through to the
    /// heuristic; cancellation does not.
    async fn select(
        &self,
        step: &Step,
        session: &Session,
        mode: SelectionMode,
        tools: &[ToolDef],
        cancel: Option<&CancellationToken>,
    ) -> AgentResult<Option<Selection>> {
        let prompt = selection_prompt(step, &selection_context(session), mode, tools);
        match self
            .models
            .chat
            .generate_chat(&[ChatMessage::user(prompt)], None, cancel)
            .await
        {
            Ok(reply) => {
                let selection = parse_selection(&reply);
                if selection.is_none() {
                    tracing::debug!("Unparsable tool selection for step {}: {}", step.step, reply);
                }
                Ok(selection)
            }
            Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!("Tool selection failed for step {}: {}", step.step, e);
                Ok(None)
            }
        }
    }

    /// Once every step has run, ask for a short recap and keep it as memory
    async fn summarize_if_complete(&self, session: &mut Session, env: &ExecutionEnv<'_>) {
        if session.summarized || !session.is_complete() {
            return;
        }
        session.summarized = true;

        let mut prompt = String::from(
            "Summarize in two or three sentences what this plan accomplished, for future context.\n\n# Steps\n",
        );
        for record in &session.records {
            prompt.push_str(&format!(
                "- {}{}\n",
                record.label,
                if record.error.is_some() { " (failed)" } else { "" }
            ));
        }
        if !session.files_changed.is_empty() {
            prompt.push_str("\n# Files changed\n");
            for path in &session.files_changed {
                prompt.push_str(&format!("- {}\n", path));
            }
        }

        match self.models.chat.generate_text(&prompt).await {
            Ok(recap) if !recap.trim().is_empty() => {
                let recap = recap.trim().to_string();
                env.sink.post_message("summary", json!({ "text": recap }));
                session.memory.push(recap);
            }
            Ok(_) => tracing::debug!("Empty plan recap"),
            Err(e) => tracing::warn!("Plan recap failed: {}", e),
        }
    }
}

/// Recent tool outputs and retrieved chunks, for the selection prompt
fn selection_context(session: &Session) -> String {
    let mut lines: Vec<String> = session.tool_outputs.iter().cloned().collect();
    for scored in session.retrieved.iter().take(5) {
        lines.push(format!(
            "retrieved {} ({}:{}-{})",
            scored.chunk.name, scored.chunk.file_path, scored.chunk.start_line, scored.chunk.end_line
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::RecordingSink;
    use crate::parser::{Chunk, ContentType};
    use crate::planner::plan::Plan;
    use crate::retrieval::ScoredChunk;
    use crate::testing::{models, FailingModel, StubModel};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tools::custom::CustomToolRegistry;

    fn executor_with(dir: &TempDir, models: Models) -> Executor {
        let config = Arc::new(Config::for_workspace(dir.path()));
        let store = Arc::new(ChunkStore::new(config.chunks_path()));
        let retrieval = Arc::new(RetrievalEngine::new(store.clone(), models.clone(), None));
        let tools = Arc::new(ToolRegistry::new(Vec::new(), CustomToolRegistry::with_defaults()));
        Executor::new(config, models, store, retrieval, tools)
    }

    fn executor(dir: &TempDir, chat: StubModel) -> (Executor, Arc<StubModel>) {
        let (models, stub) = models(chat, None);
        (executor_with(dir, models), stub)
    }

    fn session(steps: Vec<Step>) -> Session {
        let mut plan = Plan { steps };
        plan.renumber();
        let mut session = Session::new("test");
        session.install_plan(plan);
        session
    }

    fn fifteen_lines() -> String {
        (1..=15).map(|i| format!("line {}\n", i)).collect()
    }

    #[tokio::test]
    async fn test_edit_replaces_exactly_the_retrieved_chunk_lines() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("app.ts");
        std::fs::write(&file, fifteen_lines()).unwrap();

        let (exec, _) = executor(
            &dir,
            StubModel::new(&["```ts\nconst patched = true;\n```"]).with_fallback("Patched app.ts."),
        );
        let mut session = session(vec![Step::new("Patch the handler", "requested")
            .with_tool("edit_file", json!({"path": "app.ts", "edit_spec": "Mark it as patched"}))]);
        session.retrieved = vec![ScoredChunk {
            chunk: Chunk {
                id: "c1".to_string(),
                source_tag: "ts-ast".to_string(),
                file_path: file.to_string_lossy().to_string(),
                language: "typescript".to_string(),
                content_type: ContentType::Function,
                name: "handler".to_string(),
                start_line: 10,
                end_line: 12,
                dependencies: Vec::new(),
                content: "line 10\nline 11\nline 12".to_string(),
                summary: None,
                embedding: None,
            },
            score: 0.8,
        }];

        let sink = RecordingSink::default();
        let index = PlannerIndex::new();
        let env = ExecutionEnv {
            planner_index: &index,
            sink: &sink,
            cancel: None,
        };
        let result = exec.execute_step(&mut session, 0, &env).await.unwrap();
        assert_eq!(result, "Edited app.ts lines 10-12 (RetrievedChunk)");

        let mut expected: String = (1..=9).map(|i| format!("line {}\n", i)).collect();
        expected.push_str("const patched = true;\n");
        expected.extend((13..=15).map(|i| format!("line {}\n", i)));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), expected);

        assert!(session.executed.contains(&0));
        assert_eq!(session.take_touched(), vec![file.to_string_lossy().to_string()]);
        assert_eq!(session.memory, vec!["Patched app.ts.".to_string()]);
        assert_eq!(
            sink.kinds(),
            vec!["step_started", "step_completed", "summary"]
        );
    }

    #[tokio::test]
    async fn test_unresolvable_step_is_logged_and_the_run_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let (exec, _) = executor(&dir, StubModel::new(&["I am not sure"]).with_fallback("Done."));
        let mut session = session(vec![
            Step::new("Ponder the meaning", "hmm"),
            Step::new("Show the workspace", "context").with_tool("list_directory", json!({"path": "."})),
        ]);

        let sink = RecordingSink::default();
        let index = PlannerIndex::new();
        let env = ExecutionEnv {
            planner_index: &index,
            sink: &sink,
            cancel: None,
        };
        let results = exec.execute_all(&mut session, &env).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].1.contains("Could not resolve a tool for step 1"));
        assert!(results[1].1.starts_with("Contents of .:"));
        assert!(results[1].1.contains("a.txt"));
        assert_eq!(session.executed.len(), 2);
        assert!(session.records[0].error.is_some());
        assert!(session.records[1].error.is_none());
        assert_eq!(session.memory, vec!["Done.".to_string()]);
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_an_error_result() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir, StubModel::new(&[]));
        let mut session = session(vec![
            Step::new("Read the notes", "t").with_tool("read_file", json!({"path": "missing.txt"})),
        ]);
        let sink = RecordingSink::default();
        let index = PlannerIndex::new();
        let env = ExecutionEnv {
            planner_index: &index,
            sink: &sink,
            cancel: None,
        };

        let result = exec.execute_step(&mut session, 0, &env).await.unwrap();
        assert!(result.starts_with("Error: File not found or unreadable: missing.txt"));
        assert_eq!(session.records[0].error.as_deref(), Some(result.as_str()));
        assert!(session.executed.contains(&0));
    }

    #[tokio::test]
    async fn test_auto_and_args_only_selection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello notes\n").unwrap();
        let (exec, chat) = executor(
            &dir,
            StubModel::new(&[
                r#"{"tool_name": "list_directory", "parameters": {"path": "."}}"#,
                "```json\n{\"args\": {\"path\": \"notes.txt\"}}\n```",
            ]),
        );
        let mut read = Step::new("Read the notes", "t");
        read.tool = Some("read_file".to_string());
        let mut session = session(vec![
            Step::new("Look around", "need context").with_tool("auto", json!({})),
            read,
        ]);
        let sink = RecordingSink::default();
        let index = PlannerIndex::new();
        let env = ExecutionEnv {
            planner_index: &index,
            sink: &sink,
            cancel: None,
        };

        let listed = exec.execute_step(&mut session, 0, &env).await.unwrap();
        assert!(listed.contains("notes.txt"));
        assert!(chat.prompts.lock().unwrap()[0].contains("Choose the single best tool"));

        let read = exec.execute_step(&mut session, 1, &env).await.unwrap();
        assert!(read.contains("hello notes"));
        assert!(chat.prompts.lock().unwrap()[1].contains("Fill in the arguments"));
        assert_eq!(session.saved_locations[0].name, "notes.txt");
        assert_eq!(session.tool_outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_executes_nothing() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir, StubModel::new(&[]));
        let mut session = session(vec![
            Step::new("List", "t").with_tool("list_directory", json!({"path": "."})),
        ]);
        let sink = RecordingSink::default();
        let index = PlannerIndex::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let env = ExecutionEnv {
            planner_index: &index,
            sink: &sink,
            cancel: Some(&cancel),
        };

        let err = exec.execute_all(&mut session, &env).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(session.executed.is_empty());
        assert!(session.records.is_empty());
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_propagates_and_is_logged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export const a = 1;\n").unwrap();
        let exec = executor_with(&dir, Models::new(Arc::new(FailingModel), None));
        let mut session = session(vec![Step::new("Change a", "t")
            .with_tool("edit_file", json!({"path": "a.ts", "edit_spec": "Set a to 2"}))]);
        let sink = RecordingSink::default();
        let index = PlannerIndex::new();
        let env = ExecutionEnv {
            planner_index: &index,
            sink: &sink,
            cancel: None,
        };

        let err = exec.execute_step(&mut session, 0, &env).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
        assert!(session.executed.contains(&0));
        assert!(session.records[0].error.is_some());
        assert!(session.memory.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.ts")).unwrap(),
            "export const a = 1;\n"
        );
    }

    #[tokio::test]
    async fn test_plan_mutations_through_the_executor() {
        let dir = TempDir::new().unwrap();
        let (exec, _) = executor(&dir, StubModel::new(&[]));
        let mut session = session(vec![Step::new("a", "t"), Step::new("b", "t")]);
        session.executed.insert(1);
        session.summarized = true;

        exec.insert_step(&mut session, 0, Step::new("first", "t")).unwrap();
        assert_eq!(session.executed.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert!(!session.summarized);

        let patch = json!({"action": "b, revised"});
        let updated = exec
            .update_step(&mut session, 2, patch.as_object().unwrap())
            .unwrap();
        assert_eq!(updated.step, 3);
        assert!(session.executed.is_empty());

        let removed = exec.delete_step(&mut session, 0).unwrap();
        assert_eq!(removed.action, "first");
        assert_eq!(session.plan.steps[1].step, 2);
        assert!(exec.delete_step(&mut session, 5).is_err());
    }
}
