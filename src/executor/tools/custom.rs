//! Custom tools: `tools.json` entries resolved by entrypoint name to functions
//! registered at startup.

use super::{resolve_path, require_str};
use crate::planner::plan::Args;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Entrypoint signature: workspace root and the call's arguments
pub type CustomToolFn = fn(&Path, &Args) -> Result<String>;

const MAX_TODO_HITS: usize = 200;

#[derive(Default)]
pub struct CustomToolRegistry {
    entries: HashMap<String, CustomToolFn>,
}

impl CustomToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the shipped entrypoints
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file_stats", file_stats);
        registry.register("todo_scan", todo_scan);
        registry
    }

    pub fn register(&mut self, name: &str, f: CustomToolFn) {
        self.entries.insert(name.to_string(), f);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub async fn run(&self, entrypoint: &str, root: &Path, args: &Args) -> Result<String> {
        let f = *self
            .entries
            .get(entrypoint)
            .with_context(|| format!("Unknown entrypoint: {}", entrypoint))?;
        let root: PathBuf = root.to_path_buf();
        let args = args.clone();
        tokio::task::spawn_blocking(move || f(&root, &args)).await?
    }
}

/// Line and byte counts of one file
fn file_stats(root: &Path, args: &Args) -> Result<String> {
    let path = resolve_path(root, require_str(args, &["path"])?);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let blank = content.lines().filter(|l| l.trim().is_empty()).count();
    Ok(format!(
        "{}: {} lines ({} blank), {} bytes",
        path.strip_prefix(root).unwrap_or(&path).display(),
        content.lines().count(),
        blank,
        content.len()
    ))
}

/// TODO / FIXME markers under a path (default: whole workspace)
fn todo_scan(root: &Path, args: &Args) -> Result<String> {
    let base = args
        .get("path")
        .and_then(|v| v.as_str())
        .map(|p| resolve_path(root, p))
        .unwrap_or_else(|| root.to_path_buf());

    let files = if base.is_file() {
        vec![base]
    } else {
        crate::indexer::collect_files(&base, &[], &[])?
    };

    let mut hits = Vec::new();
    'files: for file in files {
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            if line.contains("TODO") || line.contains("FIXME") {
                hits.push(format!(
                    "{}:{}: {}",
                    file.strip_prefix(root).unwrap_or(&file).display(),
                    i + 1,
                    line.trim()
                ));
                if hits.len() >= MAX_TODO_HITS {
                    break 'files;
                }
            }
        }
    }

    if hits.is_empty() {
        Ok("No TODO or FIXME markers found".to_string())
    } else {
        Ok(format!("Found {} markers:\n{}", hits.len(), hits.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shipped_entrypoints() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.ts"), "// TODO: split\n\nconst a = 1; // FIXME\n").unwrap();
        let registry = CustomToolRegistry::with_defaults();

        let args = json!({"path": "a.ts"});
        let stats = registry
            .run("file_stats", dir.path(), args.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(stats, "a.ts: 3 lines (1 blank), 38 bytes");

        let todos = registry
            .run("todo_scan", dir.path(), &Args::new())
            .await
            .unwrap();
        assert!(todos.starts_with("Found 2 markers"));
        assert!(todos.contains("a.ts:3:"));
    }

    #[tokio::test]
    async fn test_unknown_entrypoint_is_an_error() {
        let registry = CustomToolRegistry::new();
        assert!(!registry.contains("file_stats"));
        assert!(registry
            .run("file_stats", Path::new("/"), &Args::new())
            .await
            .is_err());
    }
}
