//! Plan generation: architecture context, model prompt, streamed `ui_text`
//! surfacing, and a validated, sanitized step list.

pub mod plan;
pub mod validate;

use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::executor::tools::ToolDef;
use crate::indexer::architecture::{first_level, PlannerIndex};
use crate::llm::{ChatMessage, Models};
use crate::parser::truncate_chars;
use plan::Plan;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-file cap when inlining files named in the query
const MAX_REFERENCED_FILE_CHARS: usize = 20_000;

#[derive(Default)]
pub struct PlanOptions<'a> {
    /// Recent conversation memory
    pub memory: Option<&'a str>,
    /// Plan being revised
    pub previous_plan: Option<&'a Plan>,
    /// 0-based indices of steps of `previous_plan` already executed
    pub completed: Option<&'a BTreeSet<usize>>,
    /// Receives each step's `ui_text` as soon as it is complete in the stream
    pub ui_text: Option<mpsc::UnboundedSender<String>>,
    pub cancel: Option<&'a CancellationToken>,
}

pub struct Planner {
    config: Arc<Config>,
    models: Models,
}

impl Planner {
    pub fn new(config: Arc<Config>, models: Models) -> Self {
        Self { config, models }
    }

    pub async fn run_planner(
        &self,
        query: &str,
        index: &PlannerIndex,
        tools: &[ToolDef],
        options: PlanOptions<'_>,
    ) -> AgentResult<Plan> {
        let context = self.build_context(query, index, &options).await;
        let messages = [
            ChatMessage::system(system_prompt(tools)),
            ChatMessage::user(format!("{}\n\n# Request\n{}", context, query)),
        ];

        let reply = match options.ui_text {
            Some(ui_tx) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                let generate = self.models.chat.generate_chat(&messages, Some(tx), options.cancel);
                let scan = async {
                    let mut scanner = UiTextScanner::default();
                    while let Some(delta) = rx.recv().await {
                        for text in scanner.push(&delta) {
                            let _ = ui_tx.send(text);
                        }
                    }
                };
                let (reply, ()) = tokio::join!(generate, scan);
                reply?
            }
            None => {
                self.models
                    .chat
                    .generate_chat(&messages, None, options.cancel)
                    .await?
            }
        };

        if options.cancel.map_or(false, |c| c.is_cancelled()) {
            return Err(AgentError::Cancelled);
        }

        let plan = validate::parse_plan(&reply)?;
        tracing::info!("Planned {} steps", plan.len());
        Ok(plan)
    }

    /// Architecture context document handed to the model with the request
    pub async fn build_context(&self, query: &str, index: &PlannerIndex, options: &PlanOptions<'_>) -> String {
        let root = &self.config.workspace_root;
        let mut doc = String::from("# Project\n");
        doc.push_str(&format!("Root: {}\n", root.display()));
        if let Some(summary) = index.get(&*root.to_string_lossy()) {
            doc.push_str(&format!("Summary: {}\n", summary));
        }

        if let Some(memory) = options.memory.filter(|m| !m.trim().is_empty()) {
            doc.push_str("\n# Recent memory\n");
            doc.push_str(memory.trim());
            doc.push('\n');
        }

        if let Some(previous) = options.previous_plan.filter(|p| !p.is_empty()) {
            doc.push_str("\n# Previous plan\n");
            doc.push_str(&serde_json::to_string_pretty(previous).unwrap_or_default());
            doc.push('\n');
            if let Some(completed) = options.completed.filter(|c| !c.is_empty()) {
                let numbers: Vec<String> = completed.iter().map(|i| (i + 1).to_string()).collect();
                doc.push_str(&format!("Completed steps: {}\n", numbers.join(", ")));
            }
        }

        let entries = first_level(index, root);
        if !entries.is_empty() {
            doc.push_str("\n# Top-level layout\n");
            for (path, summary) in entries {
                let name = Path::new(&path)
                    .strip_prefix(root)
                    .map(|p| p.display().to_string())
                    .unwrap_or(path);
                doc.push_str(&format!("- {}: {}\n", name, summary));
            }
        }

        for path in referenced_files(query, index) {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    doc.push_str(&format!(
                        "\n# File {}\n```\n{}\n```\n",
                        path,
                        truncate_chars(&content, MAX_REFERENCED_FILE_CHARS)
                    ));
                }
                Err(e) => tracing::debug!("Skipping referenced file {}: {}", path, e),
            }
        }

        doc
    }
}

fn system_prompt(tools: &[ToolDef]) -> String {
    let mut prompt = String::from(
        "You are a planning assistant for a code-editing agent. Break the user's request into \
         a short sequence of concrete steps, each using one tool.\n\n\
         Respond with ONLY a JSON object of the form:\n\
         {\"steps\": [{\"step\": 1, \"action\": \"...\", \"thought\": \"...\", \"ui_text\": \"...\", \
         \"tool\": \"<tool name>\", \"args\": {...}, \"files_to_edit\": [\"...\"]}]}\n\n\
         Rules:\n\
         - Never write code in the plan. Describe file contents and edits in natural language \
         using `content_spec`, `edit_spec`, `find_spec` and `replace_spec` fields; code is \
         written later, when the step runs.\n\
         - Use `\"tool\": \"auto\"` when unsure which tool fits.\n\
         - `ui_text` is one short sentence shown to the user.\n\n\
         Tools:\n",
    );
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {}\n  args: {}\n",
            tool.name, tool.description, tool.schema
        ));
    }
    prompt
}

/// Planner index file entries named in the query, matched by path suffix
pub fn referenced_files(query: &str, index: &PlannerIndex) -> Vec<String> {
    static PATH_RE: OnceLock<Regex> = OnceLock::new();
    let re = PATH_RE.get_or_init(|| {
        Regex::new(r#"["'`]([^"'`\s]+)["'`]|([\w\-./]+\.[A-Za-z0-9]+)"#).unwrap()
    });

    let mut found: Vec<String> = Vec::new();
    for cap in re.captures_iter(query) {
        let Some(m) = cap.get(1).or_else(|| cap.get(2)) else {
            continue;
        };
        let token = m.as_str().trim_start_matches("./").trim_end_matches(&['.', ','][..]);
        if token.is_empty() {
            continue;
        }
        for key in index.keys() {
            let path = Path::new(key);
            if path.extension().is_some() && path.ends_with(token) && !found.contains(key) {
                found.push(key.clone());
            }
        }
    }
    found
}

/// Incremental scanner surfacing complete `"ui_text": "…"` values from a
/// still-accumulating JSON stream. Each occurrence is emitted once.
#[derive(Default)]
pub struct UiTextScanner {
    buffer: String,
    emitted: usize,
}

impl UiTextScanner {
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        static UI_TEXT_RE: OnceLock<Regex> = OnceLock::new();
        let re = UI_TEXT_RE
            .get_or_init(|| Regex::new(r#""ui_text"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

        self.buffer.push_str(delta);
        let mut out = Vec::new();
        let mut consumed = 0;
        for cap in re.captures_iter(&self.buffer[self.emitted..]) {
            let raw = &cap[1];
            let text = serde_json::from_str::<String>(&format!("\"{}\"", raw))
                .unwrap_or_else(|_| raw.to_string());
            out.push(text);
            consumed = cap.get(0).map_or(consumed, |m| m.end());
        }
        self.emitted += consumed;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{models, StubModel};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const PLAN_REPLY: &str = r#"{"steps": [
        {"step": 1, "action": "Read the config", "thought": "Need context", "ui_text": "Reading \"config\"", "tool": "read_file", "args": {"path": "src/config.ts"}},
        {"step": 2, "action": "Add timeout", "thought": "Requested", "ui_text": "Adding the timeout", "tool": "edit_file", "args": {"path": "src/config.ts", "snippet": "A timeout option defaulting to 30 seconds"}}
    ]}"#;

    #[test]
    fn test_ui_text_scanner_emits_each_occurrence_once() {
        let mut scanner = UiTextScanner::default();
        let mut emitted = Vec::new();
        for piece in PLAN_REPLY.as_bytes().chunks(5) {
            emitted.extend(scanner.push(std::str::from_utf8(piece).unwrap()));
        }
        assert_eq!(emitted, vec!["Reading \"config\"", "Adding the timeout"]);
        assert!(scanner.push("").is_empty());
    }

    #[tokio::test]
    async fn test_run_planner_streams_ui_text_and_sanitizes() {
        let dir = TempDir::new().unwrap();
        let (models, chat) = models(StubModel::new(&[PLAN_REPLY]), None);
        let planner = Planner::new(Arc::new(Config::for_workspace(dir.path())), models);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let plan = planner
            .run_planner(
                "add a timeout to 'config.ts'",
                &PlannerIndex::new(),
                &[],
                PlanOptions {
                    ui_text: Some(tx),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(plan.len(), 2);
        let args = plan.steps[1].args.as_ref().unwrap();
        assert_eq!(args["snippet_spec"], "A timeout option defaulting to 30 seconds");

        let mut ui = Vec::new();
        while let Ok(text) = rx.try_recv() {
            ui.push(text);
        }
        assert_eq!(ui, vec!["Reading \"config\"", "Adding the timeout"]);
        assert!(chat.last_prompt().contains("# Request"));
    }

    #[tokio::test]
    async fn test_context_includes_summaries_memory_and_named_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/config.ts"), "export const timeout = 10;\n").unwrap();

        let root = dir.path().to_string_lossy().to_string();
        let file = dir.path().join("src/config.ts").to_string_lossy().to_string();
        let src = dir.path().join("src").to_string_lossy().to_string();
        let index: PlannerIndex = [
            (root, "A demo service.".to_string()),
            (src, "Application sources.".to_string()),
            (file, "Configuration constants.".to_string()),
        ]
        .into_iter()
        .collect();

        let (models, _) = models(StubModel::new(&[]), None);
        let planner = Planner::new(Arc::new(Config::for_workspace(dir.path())), models);
        let previous = validate::parse_plan(PLAN_REPLY).unwrap();
        let completed = BTreeSet::from([0]);
        let options = PlanOptions {
            memory: Some("User prefers small commits."),
            previous_plan: Some(&previous),
            completed: Some(&completed),
            ..Default::default()
        };

        let doc = planner
            .build_context("bump the timeout in src/config.ts", &index, &options)
            .await;
        assert!(doc.contains("Summary: A demo service."));
        assert!(doc.contains("User prefers small commits."));
        assert!(doc.contains("Completed steps: 1"));
        assert!(doc.contains("- src: Application sources."));
        assert!(doc.contains("export const timeout = 10;"));
    }

    #[tokio::test]
    async fn test_invalid_reply_is_structural_error() {
        let dir = TempDir::new().unwrap();
        let (models, _) = models(StubModel::new(&["I cannot help with that."]), None);
        let planner = Planner::new(Arc::new(Config::for_workspace(dir.path())), models);
        let err = planner
            .run_planner("do it", &PlannerIndex::new(), &[], PlanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Structural(_)));
    }

    #[tokio::test]
    async fn test_cancelled_planning_is_not_a_failure() {
        let dir = TempDir::new().unwrap();
        let (models, _) = models(StubModel::new(&[PLAN_REPLY]), None);
        let planner = Planner::new(Arc::new(Config::for_workspace(dir.path())), models);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = planner
            .run_planner(
                "do it",
                &PlannerIndex::new(),
                &[],
                PlanOptions {
                    ui_text: Some(tx),
                    cancel: Some(&cancel),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
