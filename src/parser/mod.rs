//! Source chunk extraction.
//!
//! Only JS/TS gets a real syntax tree. Every other language family goes through
//! a best-effort heuristic (indentation scanning, brace matching, a key-path walk
//! over raw JSON text, a CSS rule walk); unusual formatting can make those miss
//! declarations, in which case the file falls back to a single whole-file chunk.

pub mod ast;
pub mod brace;
pub mod css;
pub mod indent;
pub mod json;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;

const MAX_DEPENDENCIES: usize = 50;

/// Kind of source unit a chunk covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Function,
    Class,
    Method,
    Interface,
    Import,
    Variable,
    JsonProperty,
    CssRule,
    Other,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Function => "function",
            ContentType::Class => "class",
            ContentType::Method => "method",
            ContentType::Interface => "interface",
            ContentType::Import => "import",
            ContentType::Variable => "variable",
            ContentType::JsonProperty => "json_property",
            ContentType::CssRule => "css_rule",
            ContentType::Other => "other",
        }
    }
}

/// A named, line-bounded unit of source text; the atom of retrieval.
/// Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub source_tag: String,
    pub file_path: String,
    pub language: String,
    pub content_type: ContentType,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Text submitted to the embedding model
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{} {}\n", self.content_type.as_str(), self.name);
        if let Some(summary) = &self.summary {
            text.push_str(summary);
            text.push('\n');
        }
        text.push_str(truncate_chars(&self.content, 4000));
        text
    }
}

/// Chunk as produced by an extraction strategy, before identity is assigned
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub content_type: ContentType,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

/// One implementation per language family
pub trait ExtractionStrategy: Send + Sync {
    /// Recorded on every chunk as `sourceTag`
    fn tag(&self) -> &'static str;

    /// Extract chunks. An error means the file could not be processed at all.
    fn extract(&self, file_path: &Path, content: &str) -> Result<Vec<RawChunk>>;
}

/// Picks an extraction strategy by extension and assembles finished chunks
pub struct CodeParser {
    ast: ast::TreeSitterStrategy,
    indent: indent::IndentStrategy,
    brace: brace::BraceStrategy,
    json: json::JsonStrategy,
    css: css::CssStrategy,
}

impl CodeParser {
    pub fn new() -> Self {
        Self {
            ast: ast::TreeSitterStrategy,
            indent: indent::IndentStrategy,
            brace: brace::BraceStrategy,
            json: json::JsonStrategy,
            css: css::CssStrategy,
        }
    }

    /// Get file hash for change detection
    pub fn hash_file(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Language name for a path, derived from its extension
    pub fn language_for(file_path: &Path) -> &'static str {
        match extension(file_path).as_str() {
            "ts" | "mts" | "cts" => "typescript",
            "tsx" => "typescriptreact",
            "js" | "mjs" | "cjs" => "javascript",
            "jsx" => "javascriptreact",
            "py" | "pyi" => "python",
            "c" | "h" => "c",
            "cc" | "cpp" | "cxx" | "hpp" => "cpp",
            "java" => "java",
            "cs" => "csharp",
            "go" => "go",
            "rs" => "rust",
            "kt" => "kotlin",
            "swift" => "swift",
            "scala" => "scala",
            "php" => "php",
            "json" => "json",
            "css" => "css",
            "scss" => "scss",
            "less" => "less",
            _ => "plaintext",
        }
    }

    fn strategy_for(&self, file_path: &Path) -> Option<&dyn ExtractionStrategy> {
        let strategy: &dyn ExtractionStrategy = match extension(file_path).as_str() {
            "ts" | "tsx" | "mts" | "cts" | "js" | "jsx" | "mjs" | "cjs" => &self.ast,
            "py" | "pyi" => &self.indent,
            "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" | "java" | "cs" | "go" | "rs" | "kt"
            | "swift" | "scala" | "php" => &self.brace,
            "json" => &self.json,
            "css" | "scss" | "less" => &self.css,
            _ => return None,
        };
        Some(strategy)
    }

    /// Parse a file into chunks. Never fails: a strategy error or an empty result
    /// degrades to one whole-file chunk.
    pub fn parse(&self, file_path: &Path, content: &str) -> Vec<Chunk> {
        let language = Self::language_for(file_path);

        let (tag, raw) = match self.strategy_for(file_path) {
            Some(strategy) => match strategy.extract(file_path, content) {
                Ok(raw) if !raw.is_empty() => (strategy.tag(), raw),
                Ok(_) => (WHOLE_FILE_TAG, vec![whole_file_chunk(file_path, content)]),
                Err(e) => {
                    tracing::warn!(
                        "Extraction failed for {}, indexing whole file: {}",
                        file_path.display(),
                        e
                    );
                    (WHOLE_FILE_TAG, vec![whole_file_chunk(file_path, content)])
                }
            },
            None => (WHOLE_FILE_TAG, vec![whole_file_chunk(file_path, content)]),
        };

        let path = file_path.to_string_lossy().to_string();
        raw.into_iter()
            .map(|r| Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                source_tag: tag.to_string(),
                file_path: path.clone(),
                language: language.to_string(),
                content_type: r.content_type,
                dependencies: extract_dependencies(&r.content),
                name: r.name,
                start_line: r.start_line,
                end_line: r.end_line.max(r.start_line),
                content: r.content,
                summary: None,
                embedding: None,
            })
            .collect()
    }
}

impl Default for CodeParser {
    fn default() -> Self {
        Self::new()
    }
}

pub const WHOLE_FILE_TAG: &str = "whole-file";

fn whole_file_chunk(file_path: &Path, content: &str) -> RawChunk {
    RawChunk {
        content_type: ContentType::Other,
        name: file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        start_line: 1,
        end_line: content.lines().count().max(1),
        content: content.to_string(),
    }
}

fn extension(file_path: &Path) -> String {
    file_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Callee-name heuristic: up to 50 distinct identifier-like tokens directly followed by `(`
pub fn extract_dependencies(content: &str) -> Vec<String> {
    static CALL_RE: OnceLock<Regex> = OnceLock::new();
    let re = CALL_RE.get_or_init(|| Regex::new(r"([A-Za-z_$][A-Za-z0-9_$]*)\(").unwrap());

    let mut deps: Vec<String> = Vec::new();
    for cap in re.captures_iter(content) {
        let name = &cap[1];
        if !deps.iter().any(|d| d == name) {
            deps.push(name.to_string());
            if deps.len() >= MAX_DEPENDENCIES {
                break;
            }
        }
    }
    deps
}

/// 1-based line number of a byte offset
pub fn line_at(content: &str, byte_offset: usize) -> usize {
    let end = byte_offset.min(content.len());
    content.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
}

/// Text of lines `start..=end` (1-based), joined with `\n`
pub fn slice_lines(lines: &[&str], start: usize, end: usize) -> String {
    let from = start.saturating_sub(1).min(lines.len());
    let to = end.min(lines.len());
    lines[from..to].join("\n")
}

pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
