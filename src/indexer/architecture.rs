//! Bottom-up directory summaries: files, then directories deepest first, then
//! the project root. Stored in `planner_index.json` as a flat path → sentence map.

use super::{clean_summary, collect_files};
use crate::config::Config;
use crate::host::EventSink;
use crate::llm::Models;
use crate::parser::{truncate_chars, CodeParser};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::timeout;

/// Absolute path (file, directory or root) → one-sentence summary
pub type PlannerIndex = BTreeMap<String, String>;

const FILE_PREVIEW_CHARS: usize = 4000;

pub struct ArchitectureIndexer {
    config: Arc<Config>,
    models: Models,
    index: RwLock<PlannerIndex>,
}

impl ArchitectureIndexer {
    pub fn new(config: Arc<Config>, models: Models) -> Self {
        Self {
            config,
            models,
            index: RwLock::new(PlannerIndex::new()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let path = self.config.planner_index_path();
        if path.exists() {
            let raw = fs::read_to_string(&path).await?;
            let index: PlannerIndex = serde_json::from_str(&raw)?;
            tracing::info!("Loaded planner index with {} entries", index.len());
            *self.index.write().await = index;
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let path = self.config.planner_index_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(&*self.index.read().await)?;
        fs::write(&path, raw).await?;
        Ok(())
    }

    pub async fn snapshot(&self) -> PlannerIndex {
        self.index.read().await.clone()
    }

    pub async fn clear(&self) {
        self.index.write().await.clear();
    }

    /// Rebuild the whole index from scratch
    pub async fn build_index(&self, sink: &dyn EventSink) -> Result<PlannerIndex> {
        let root = self.config.workspace_root.clone();
        let mut exclude = self.config.exclude_globs.clone();
        exclude.extend(self.config.load_indexignore());
        let files = collect_files(&root, &self.config.include_globs, &exclude)?;
        let total = files.len().max(1);

        sink.report(Some("Summarizing files"), Some(0.0));
        let mut index = PlannerIndex::new();
        let mut done = 0usize;
        let mut summaries = stream::iter(files.iter().cloned())
            .map(|path| async move {
                let summary = self.summarize_file(&path).await;
                (path, summary)
            })
            .buffer_unordered(self.config.index_concurrency.max(1));
        while let Some((path, summary)) = summaries.next().await {
            done += 1;
            if let Some(summary) = summary {
                index.insert(path.to_string_lossy().to_string(), summary);
            }
            sink.report(None, Some(done as f32 * 80.0 / total as f32));
        }
        drop(summaries);

        let mut dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for file in &files {
            for ancestor in file.ancestors().skip(1) {
                if ancestor == root || !ancestor.starts_with(&root) {
                    break;
                }
                dirs.insert(ancestor.to_path_buf());
            }
        }
        let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
        dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

        sink.report(Some("Summarizing directories"), Some(80.0));
        for dir in &dirs {
            self.recompute_dir(&mut index, dir).await;
        }
        self.recompute_dir(&mut index, &root).await;

        *self.index.write().await = index.clone();
        self.save().await?;
        sink.report(Some("Architecture index complete"), Some(100.0));
        tracing::info!("Built planner index with {} entries", index.len());
        Ok(index)
    }

    /// Summarize a new or changed file, then recompute only its ancestor chain
    pub async fn update_for_added(&self, path: &Path) -> Result<()> {
        let path = self.absolute(path);
        let mut index = self.snapshot().await;
        match self.summarize_file(&path).await {
            Some(summary) => {
                index.insert(path.to_string_lossy().to_string(), summary);
            }
            None => {
                index.remove(&*path.to_string_lossy());
            }
        }
        self.recompute_ancestors(&mut index, &path).await;
        *self.index.write().await = index;
        self.save().await
    }

    /// Drop a file (or a whole directory subtree), then recompute its ancestor chain
    pub async fn update_for_removed(&self, path: &Path) -> Result<()> {
        let path = self.absolute(path);
        let mut index = self.snapshot().await;
        index.retain(|key, _| !Path::new(key).starts_with(&path));
        self.recompute_ancestors(&mut index, &path).await;
        *self.index.write().await = index;
        self.save().await
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.workspace_root.join(path)
        }
    }

    async fn recompute_ancestors(&self, index: &mut PlannerIndex, path: &Path) {
        let root = &self.config.workspace_root;
        for ancestor in path.ancestors().skip(1) {
            if !ancestor.starts_with(root) {
                break;
            }
            self.recompute_dir(index, ancestor).await;
            if ancestor == root.as_path() {
                break;
            }
        }
    }

    /// Summarize `dir` from its immediate children only. A directory left with
    /// no children is removed.
    async fn recompute_dir(&self, index: &mut PlannerIndex, dir: &Path) {
        let children: Vec<(String, String)> = index
            .iter()
            .filter(|(key, _)| Path::new(key.as_str()).parent() == Some(dir))
            .map(|(key, summary)| {
                let name = Path::new(key.as_str())
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| key.clone());
                (name, summary.clone())
            })
            .collect();

        let key = dir.to_string_lossy().to_string();
        if children.is_empty() {
            index.remove(&key);
            return;
        }

        let is_root = dir == self.config.workspace_root.as_path();
        let listing: String = children
            .iter()
            .map(|(name, summary)| format!("- {}: {}\n", name, summary))
            .collect();
        let prompt = format!(
            "{} `{}` contains:\n{}\nDescribe its purpose in one sentence. Reply with the sentence only.",
            if is_root { "The project root" } else { "The directory" },
            key,
            listing
        );

        let summary = self.ask(&prompt).await.unwrap_or_else(|| {
            let names: Vec<&str> = children.iter().map(|(n, _)| n.as_str()).collect();
            format!("Contains {}.", names.join(", "))
        });
        index.insert(key, summary);
    }

    async fn summarize_file(&self, path: &Path) -> Option<String> {
        let content = super::read_text(path).await?;
        let prompt = format!(
            "Summarize the purpose of the {} file `{}` in one sentence. Reply with the sentence only.\n\n{}",
            CodeParser::language_for(path),
            path.display(),
            truncate_chars(&content, FILE_PREVIEW_CHARS)
        );
        let fallback = format!(
            "{} file {}.",
            CodeParser::language_for(path),
            path.file_name()?.to_string_lossy()
        );
        Some(self.ask(&prompt).await.unwrap_or(fallback))
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        match timeout(self.config.summary_timeout, self.models.chat.generate_text(prompt)).await {
            Ok(Ok(text)) => clean_summary(&text),
            Ok(Err(e)) => {
                tracing::warn!("Architecture summary failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!("Architecture summary timed out");
                None
            }
        }
    }
}

fn depth(path: &Path) -> usize {
    path.components().count()
}

/// First-level entries (immediate children of the root) with their summaries
pub fn first_level(index: &PlannerIndex, root: &Path) -> Vec<(String, String)> {
    index
        .iter()
        .filter(|(key, _)| Path::new(key.as_str()).parent() == Some(root))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
