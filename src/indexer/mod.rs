//! Workspace indexer: walks the project, extracts chunks, annotates them with
//! summaries and embeddings, and keeps the chunk store current.

pub mod architecture;

use crate::config::{Config, STATE_DIR};
use crate::host::EventSink;
use crate::llm::Models;
use crate::parser::{truncate_chars, Chunk, CodeParser};
use crate::store::ChunkStore;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::time::timeout;

/// Files above this size are never indexed
pub const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Directories skipped regardless of ignore files
const ALWAYS_SKIPPED_DIRS: &[&str] = &[STATE_DIR, "node_modules", ".git"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks: usize,
}

enum FileOutcome {
    Indexed(usize),
    Unchanged,
    Skipped,
    Failed,
}

pub struct Indexer {
    config: Arc<Config>,
    models: Models,
    store: Arc<ChunkStore>,
    parser: CodeParser,
}

impl Indexer {
    pub fn new(config: Arc<Config>, models: Models, store: Arc<ChunkStore>) -> Self {
        Self {
            config,
            models,
            store,
            parser: CodeParser::new(),
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Index every matched file under the workspace root. Unchanged files
    /// (same content hash) are skipped; files that disappeared are purged.
    pub async fn index_workspace(
        &self,
        include: &[String],
        exclude: &[String],
        sink: &dyn EventSink,
    ) -> Result<IndexReport> {
        let mut exclude = exclude.to_vec();
        exclude.extend(self.config.load_indexignore());
        let files = collect_files(&self.config.workspace_root, include, &exclude)?;
        let total = files.len();

        tracing::info!(
            "Indexing {} files under {}",
            total,
            self.config.workspace_root.display()
        );
        sink.report(Some(&format!("Indexing {} files", total)), Some(0.0));

        let mut report = IndexReport::default();
        for (i, path) in files.iter().enumerate() {
            match self.index_file(path, false).await {
                FileOutcome::Indexed(n) => {
                    report.files_indexed += 1;
                    report.chunks += n;
                }
                FileOutcome::Unchanged | FileOutcome::Skipped => report.files_skipped += 1,
                FileOutcome::Failed => report.files_failed += 1,
            }

            let label = path
                .strip_prefix(&self.config.workspace_root)
                .unwrap_or(path)
                .display()
                .to_string();
            sink.report(Some(&label), Some((i + 1) as f32 * 100.0 / total as f32));
        }

        let live: HashSet<String> = files
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        for stale in self.store.indexed_files().await {
            if !live.contains(&stale) {
                let removed = self.store.remove_file(&stale).await;
                tracing::debug!("Purged {} chunks of vanished file {}", removed, stale);
            }
        }

        self.store.save().await?;
        sink.report(Some("Indexing complete"), Some(100.0));
        tracing::info!(
            "Indexed {} files ({} chunks), skipped {}, failed {}",
            report.files_indexed,
            report.chunks,
            report.files_skipped,
            report.files_failed
        );
        Ok(report)
    }

    /// Re-index exactly `paths`, ignoring stored hashes. A path that no longer
    /// exists is removed from the store instead.
    pub async fn update_for_files(&self, paths: &[PathBuf]) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        for path in paths {
            let path = self.absolute(path);
            if !path.exists() {
                self.store.remove_file(&path.to_string_lossy()).await;
                report.files_skipped += 1;
                continue;
            }
            match self.index_file(&path, true).await {
                FileOutcome::Indexed(n) => {
                    report.files_indexed += 1;
                    report.chunks += n;
                }
                FileOutcome::Unchanged | FileOutcome::Skipped => report.files_skipped += 1,
                FileOutcome::Failed => report.files_failed += 1,
            }
        }
        self.store.save().await?;
        Ok(report)
    }

    /// Purge every chunk of `path`; returns how many were removed
    pub async fn remove_file(&self, path: &Path) -> Result<usize> {
        let path = self.absolute(path);
        let removed = self.store.remove_file(&path.to_string_lossy()).await;
        self.store.save().await?;
        tracing::info!("Removed {} chunks of {}", removed, path.display());
        Ok(removed)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.workspace_root.join(path)
        }
    }

    async fn index_file(&self, path: &Path, force: bool) -> FileOutcome {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Failed to stat {}: {}", path.display(), e);
                return FileOutcome::Failed;
            }
        };
        if meta.len() > MAX_FILE_BYTES {
            tracing::debug!("Skipping large file {} ({} bytes)", path.display(), meta.len());
            return FileOutcome::Skipped;
        }
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                return FileOutcome::Failed;
            }
        };
        let Ok(content) = String::from_utf8(bytes) else {
            tracing::debug!("Skipping binary file {}", path.display());
            return FileOutcome::Skipped;
        };

        let key = path.to_string_lossy().to_string();
        let hash = CodeParser::hash_file(&content);
        if !force && self.store.file_hash(&key).await.as_deref() == Some(hash.as_str()) {
            return FileOutcome::Unchanged;
        }

        let chunks = self.parser.parse(path, &content);
        let chunks = self.annotate_all(chunks).await;
        let count = chunks.len();
        self.store.replace_file(&key, hash, chunks).await;
        tracing::debug!("Indexed {} ({} chunks)", path.display(), count);
        FileOutcome::Indexed(count)
    }

    /// Summaries and embeddings through a bounded pool; each call races its own timeout
    async fn annotate_all(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        let embeds = self.config.embed_chunks && self.models.embedder.is_some();
        if !self.config.summarize_chunks && !embeds {
            return chunks;
        }

        let mut annotated: Vec<(usize, Chunk)> = stream::iter(chunks.into_iter().enumerate())
            .map(|(i, chunk)| async move { (i, self.annotate(chunk).await) })
            .buffer_unordered(self.config.index_concurrency.max(1))
            .collect()
            .await;
        annotated.sort_by_key(|(i, _)| *i);
        annotated.into_iter().map(|(_, c)| c).collect()
    }

    async fn annotate(&self, mut chunk: Chunk) -> Chunk {
        if self.config.summarize_chunks {
            let prompt = summary_prompt(&chunk);
            match timeout(self.config.summary_timeout, self.models.chat.generate_text(&prompt)).await {
                Ok(Ok(text)) => chunk.summary = clean_summary(&text),
                Ok(Err(e)) => tracing::debug!("Summary failed for {}: {}", chunk.name, e),
                Err(_) => tracing::debug!("Summary timed out for {}", chunk.name),
            }
        }

        if self.config.embed_chunks && self.models.embedder.is_some() {
            let text = chunk.embedding_text();
            match timeout(self.config.embedding_timeout, self.models.embed(&text)).await {
                Ok(embedding) => chunk.embedding = embedding,
                Err(_) => tracing::debug!("Embedding timed out for {}", chunk.name),
            }
        }

        chunk
    }
}

/// Read a file as text; `None` for oversized, unreadable or non-UTF-8 files
pub async fn read_text(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() > MAX_FILE_BYTES {
        return None;
    }
    let bytes = fs::read(path).await.ok()?;
    String::from_utf8(bytes).ok()
}

fn summary_prompt(chunk: &Chunk) -> String {
    format!(
        "Summarize what the following {} `{}` from {} does in one sentence. Reply with the sentence only.\n\n{}",
        chunk.content_type.as_str(),
        chunk.name,
        chunk.file_path,
        truncate_chars(&chunk.content, 4000)
    )
}

/// First non-empty line of a model reply, unquoted and bounded
pub fn clean_summary(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_matches(|c| c == '"' || c == '`' || c == '\'').trim();
    if line.is_empty() {
        return None;
    }
    Some(truncate_chars(line, 400).to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Every file under `root` matching `include` (empty means all) and not
/// matching `exclude`. Exclusions also apply to ancestor directories, so
/// `dist` and `dist/**` behave the same. Sorted for deterministic order.
pub fn collect_files(root: &Path, include: &[String], exclude: &[String]) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(include)?;
    let exclude_set = build_globset(exclude)?;

    let walker = WalkBuilder::new(root)
        .standard_filters(true)
        .hidden(true)
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(true, |name| !ALWAYS_SKIPPED_DIRS.contains(&name))
        })
        .build();

    let mut files = Vec::new();
    for entry in walker.flatten() {
        if entry.file_type().map_or(true, |ft| !ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };

        if !include.is_empty() && !include_set.is_match(rel) {
            continue;
        }
        if rel.ancestors().any(|p| !p.as_os_str().is_empty() && exclude_set.is_match(p)) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentResult;
    use crate::host::testing::RecordingSink;
    use crate::llm::{ChatMessage, ModelProvider};
    use crate::parser::ContentType;
    use crate::testing::{models, StubEmbedder, StubModel};
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const UTIL_TS: &str = "export function add(a: number, b: number): number {\n  return a + b;\n}\n";

    fn indexer(dir: &TempDir, models: Models) -> Indexer {
        let config = Arc::new(Config::for_workspace(dir.path()));
        let store = Arc::new(ChunkStore::new(config.chunks_path()));
        Indexer::new(config, models, store)
    }

    fn all() -> Vec<String> {
        vec!["**/*".to_string()]
    }

    #[tokio::test]
    async fn test_single_exported_function() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("util.ts"), UTIL_TS).unwrap();
        let (models, _) = models(
            StubModel::new(&[]).with_fallback("Adds two numbers."),
            Some(StubEmbedder::fixed(vec![1.0, 0.0, 0.0])),
        );
        let indexer = indexer(&dir, models);
        let sink = RecordingSink::default();

        let report = indexer.index_workspace(&all(), &[], &sink).await.unwrap();
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.chunks, 1);

        let chunks = indexer.store().chunks().await;
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk.content_type, ContentType::Function);
        assert_eq!(chunk.name, "add");
        assert_eq!((chunk.start_line, chunk.end_line), (1, 3));
        assert_eq!(chunk.summary.as_deref(), Some("Adds two numbers."));
        assert_eq!(chunk.embedding.as_deref(), Some(&[1.0, 0.0, 0.0][..]));

        assert!(sink.kinds().iter().all(|k| k == "progress"));
        assert!(dir.path().join(".code-agent/chunks.json").exists());
    }

    #[tokio::test]
    async fn test_unchanged_files_are_skipped_and_updates_keep_ids_unique() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("math.js");
        std::fs::write(&file, "function a() {}\nfunction b() {}\n").unwrap();
        let (models, chat) = models(StubModel::new(&[]).with_fallback("Does math."), None);
        let indexer = indexer(&dir, models);
        let sink = RecordingSink::default();

        indexer.index_workspace(&all(), &[], &sink).await.unwrap();
        let calls_after_first = chat.prompt_count();
        let second = indexer.index_workspace(&all(), &[], &sink).await.unwrap();
        assert_eq!(second.files_skipped, 1);
        assert_eq!(chat.prompt_count(), calls_after_first);

        for _ in 0..3 {
            indexer.update_for_files(&[PathBuf::from("math.js")]).await.unwrap();
        }
        let chunks = indexer.store().chunks().await;
        assert_eq!(chunks.len(), 2);
        let ids: HashSet<_> = chunks.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_file_is_purged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    return 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "def g():\n    return 2\n").unwrap();
        let (models, _) = models(StubModel::new(&[]), None);
        let mut config = Config::for_workspace(dir.path());
        config.summarize_chunks = false;
        let config = Arc::new(config);
        let indexer = Indexer::new(
            config.clone(),
            models,
            Arc::new(ChunkStore::new(config.chunks_path())),
        );

        indexer
            .index_workspace(&all(), &[], &RecordingSink::default())
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("a.py")).unwrap();
        let report = indexer
            .update_for_files(&[dir.path().join("a.py")])
            .await
            .unwrap();
        assert_eq!(report.files_indexed, 0);

        let names: Vec<_> = indexer
            .store()
            .chunks()
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["g"]);
    }

    #[tokio::test]
    async fn test_exclusions_and_state_dir_are_not_indexed() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".code-agent")).unwrap();
        std::fs::write(dir.path().join("dist/bundle.js"), "function x() {}\n").unwrap();
        std::fs::write(dir.path().join("src/app.js"), "function y() {}\n").unwrap();
        std::fs::write(dir.path().join("src/gen.js"), "function z() {}\n").unwrap();
        std::fs::write(dir.path().join(".code-agent/.indexignore"), "# generated\nsrc/gen.js\n").unwrap();

        let files = collect_files(dir.path(), &all(), &["dist".to_string()]).unwrap();
        assert_eq!(files.len(), 2);

        let (models, _) = models(StubModel::new(&[]), None);
        let indexer = indexer(&dir, models);
        indexer
            .index_workspace(&all(), &["dist/**".to_string()], &RecordingSink::default())
            .await
            .unwrap();
        let files = indexer.store().indexed_files().await;
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/app.js"));
    }

    struct StalledModel;

    #[async_trait::async_trait]
    impl ModelProvider for StalledModel {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn generate_text(&self, _prompt: &str) -> AgentResult<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }

        async fn generate_chat(
            &self,
            _messages: &[ChatMessage],
            _on_chunk: Option<mpsc::UnboundedSender<String>>,
            _cancel: Option<&CancellationToken>,
        ) -> AgentResult<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_stalled_summary_times_out_without_blocking() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("util.ts"), UTIL_TS).unwrap();
        let mut config = Config::for_workspace(dir.path());
        config.summary_timeout = Duration::from_millis(50);
        let config = Arc::new(config);
        let models = Models::new(
            Arc::new(StalledModel),
            Some(Arc::new(StubEmbedder::fixed(vec![0.5, 0.5]))),
        );
        let indexer = Indexer::new(
            config.clone(),
            models,
            Arc::new(ChunkStore::new(config.chunks_path())),
        );

        let report = indexer
            .index_workspace(&all(), &[], &RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(report.chunks, 1);
        let chunk = &indexer.store().chunks().await[0];
        assert!(chunk.summary.is_none());
        assert!(chunk.embedding.is_some());
    }

    #[test]
    fn test_clean_summary() {
        assert_eq!(
            clean_summary("\n  \"Parses the config file.\"\nExtra"),
            Some("Parses the config file.".to_string())
        );
        assert_eq!(clean_summary("   \n "), None);
    }
}
