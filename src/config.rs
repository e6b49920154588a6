use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the hidden per-project state directory
pub const STATE_DIR: &str = ".code-agent";

const DEFAULT_COMMAND_ALLOWLIST: &[&str] = &[
    "npm ", "npx ", "yarn ", "pnpm ", "node ", "tsc", "eslint", "prettier", "jest", "vitest",
    "python ", "python3 ", "pytest", "pip ", "cargo ", "go ", "make", "git status", "git diff",
    "git log", "ls", "cat ", "echo ",
];

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    None,
}

impl ProviderKind {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "none" | "" => Ok(Self::None),
            other => anyhow::bail!("Unknown provider: {}", other),
        }
    }
}

/// Runtime configuration, assembled from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub llm_provider: ProviderKind,
    pub embedding_provider: ProviderKind,
    pub ollama_host: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub rerank_url: Option<String>,
    pub rerank_api_key: Option<String>,
    pub rerank_model: String,
    pub index_concurrency: usize,
    pub summary_timeout: Duration,
    pub embedding_timeout: Duration,
    pub summarize_chunks: bool,
    pub embed_chunks: bool,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub command_allowlist: Vec<String>,
    pub command_timeout: Duration,
    pub formatter_command: String,
    pub retrieval_top_k: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let workspace_root = match std::env::var("WORKSPACE_ROOT") {
            Ok(root) => PathBuf::from(root),
            Err(_) => std::env::current_dir().context("Failed to resolve current directory")?,
        };
        let workspace_root = workspace_root
            .canonicalize()
            .with_context(|| format!("Workspace root does not exist: {}", workspace_root.display()))?;

        let llm_provider = ProviderKind::parse(&env_or("LLM_PROVIDER", "ollama"))?;
        let embedding_provider = match std::env::var("EMBEDDING_PROVIDER") {
            Ok(value) => ProviderKind::parse(&value)?,
            Err(_) => llm_provider.clone(),
        };

        Ok(Self {
            workspace_root,
            llm_provider,
            embedding_provider,
            ollama_host: env_or("OLLAMA_HOST", "http://127.0.0.1:11434"),
            chat_model: env_or("CHAT_MODEL", "llama3.1"),
            embedding_model: env_or("EMBEDDING_MODEL", "nomic-embed-text"),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            rerank_url: std::env::var("RERANK_URL").ok().filter(|s| !s.trim().is_empty()),
            rerank_api_key: std::env::var("RERANK_API_KEY").ok(),
            rerank_model: env_or("RERANK_MODEL", "rerank-english-v3.0"),
            index_concurrency: env_parse("INDEX_CONCURRENCY", 4usize).max(1),
            summary_timeout: Duration::from_secs(env_parse("SUMMARY_TIMEOUT_SECS", 30)),
            embedding_timeout: Duration::from_secs(env_parse("EMBEDDING_TIMEOUT_SECS", 20)),
            summarize_chunks: env_parse("SUMMARIZE_CHUNKS", true),
            embed_chunks: env_parse("EMBED_CHUNKS", true),
            include_globs: env_list("INCLUDE_GLOBS").unwrap_or_else(|| vec!["**/*".to_string()]),
            exclude_globs: env_list("EXCLUDE_GLOBS").unwrap_or_default(),
            command_allowlist: env_list("COMMAND_ALLOWLIST").unwrap_or_else(|| {
                DEFAULT_COMMAND_ALLOWLIST
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }),
            command_timeout: Duration::from_secs(env_parse("COMMAND_TIMEOUT_SECS", 60)),
            formatter_command: env_or("FORMATTER_COMMAND", "npx prettier --write"),
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", 8usize).max(1),
        })
    }

    /// Configuration rooted at `root` with every model-facing feature at its default
    pub fn for_workspace(root: &Path) -> Self {
        Self {
            workspace_root: root.to_path_buf(),
            llm_provider: ProviderKind::Ollama,
            embedding_provider: ProviderKind::Ollama,
            ollama_host: "http://127.0.0.1:11434".to_string(),
            chat_model: "llama3.1".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            rerank_url: None,
            rerank_api_key: None,
            rerank_model: "rerank-english-v3.0".to_string(),
            index_concurrency: 4,
            summary_timeout: Duration::from_secs(30),
            embedding_timeout: Duration::from_secs(20),
            summarize_chunks: true,
            embed_chunks: true,
            include_globs: vec!["**/*".to_string()],
            exclude_globs: Vec::new(),
            command_allowlist: DEFAULT_COMMAND_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            command_timeout: Duration::from_secs(60),
            formatter_command: "npx prettier --write".to_string(),
            retrieval_top_k: 8,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.workspace_root.join(STATE_DIR)
    }

    pub fn chunks_path(&self) -> PathBuf {
        self.state_dir().join("chunks.json")
    }

    pub fn planner_index_path(&self) -> PathBuf {
        self.state_dir().join("planner_index.json")
    }

    pub fn tools_path(&self) -> PathBuf {
        self.state_dir().join("tools.json")
    }

    /// Exclusion globs from `.indexignore` files (state dir first, then root)
    pub fn load_indexignore(&self) -> Vec<String> {
        let candidates = [
            self.state_dir().join(".indexignore"),
            self.workspace_root.join(".indexignore"),
        ];

        let mut patterns = Vec::new();
        for path in candidates {
            if let Ok(text) = std::fs::read_to_string(&path) {
                tracing::debug!("Loaded ignore patterns from {}", path.display());
                patterns.extend(parse_indexignore(&text));
            }
        }
        patterns
    }
}

/// Parse `.indexignore` content: one glob per line, `#` and `//` comment lines skipped
pub fn parse_indexignore(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
        .map(str::to_string)
        .collect()
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid value for {}: {}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_indexignore_skips_comments() {
        let text = "# build output\ndist/**\n\n// vendored\nvendor/**\n  *.min.js  \n";
        assert_eq!(
            parse_indexignore(text),
            vec!["dist/**", "vendor/**", "*.min.js"]
        );
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("Ollama").unwrap(), ProviderKind::Ollama);
        assert_eq!(ProviderKind::parse("openai").unwrap(), ProviderKind::OpenAi);
        assert_eq!(ProviderKind::parse("none").unwrap(), ProviderKind::None);
        assert!(ProviderKind::parse("mystery").is_err());
    }

    #[test]
    fn test_state_paths() {
        let config = Config::for_workspace(Path::new("/work/project"));
        assert_eq!(
            config.chunks_path(),
            PathBuf::from("/work/project/.code-agent/chunks.json")
        );
        assert_eq!(
            config.planner_index_path(),
            PathBuf::from("/work/project/.code-agent/planner_index.json")
        );
    }
}
