//! Similarity retrieval over the chunk store, with optional reranking and
//! import-following context expansion.

pub mod rerank;

use crate::embedding::cosine_similarity;
use crate::llm::Models;
use crate::parser::{truncate_chars, Chunk, ContentType};
use crate::store::ChunkStore;
use regex::Regex;
use rerank::Reranker;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Floor score of a chunk matched by a quoted identifier in the query
pub const LITERAL_HIT_SCORE: f32 = 0.25;
/// Score of chunks pulled in by context expansion
pub const EXPANSION_SCORE: f32 = 0.05;
const MAX_EXPANSION: usize = 10;
const RERANK_DOCUMENT_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Similarity score, or the relevance score after reranking
    pub score: f32,
}

pub struct RetrievalEngine {
    store: Arc<ChunkStore>,
    models: Models,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RetrievalEngine {
    pub fn new(store: Arc<ChunkStore>, models: Models, reranker: Option<Arc<dyn Reranker>>) -> Self {
        Self {
            store,
            models,
            reranker,
        }
    }

    /// Retrieve, rerank and expand in one pass
    pub async fn retrieve(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        let candidates = self.retrieve_candidates(query, k).await;
        let reranked = self.rerank(query, candidates).await;
        self.expand_context(reranked).await
    }

    /// At most `k` chunks, sorted by descending score. Chunks whose name or
    /// content contains a quoted identifier from the query score at least
    /// `LITERAL_HIT_SCORE`.
    pub async fn retrieve_candidates(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        let chunks = self.store.chunks().await;
        let identifiers = quoted_identifiers(query);

        let query_vector = if chunks.iter().any(|c| c.embedding.is_some()) {
            self.models.embed(query).await
        } else {
            None
        };

        let similarity = |chunk: &Chunk| -> Option<f32> {
            let query_vector = query_vector.as_ref()?;
            let embedding = chunk.embedding.as_ref()?;
            Some(cosine_similarity(query_vector, embedding))
        };

        let mut scored: Vec<ScoredChunk> = Vec::new();
        if query_vector.is_some() {
            scored = chunks
                .iter()
                .filter_map(|c| {
                    similarity(c).map(|score| ScoredChunk {
                        chunk: c.clone(),
                        score,
                    })
                })
                .collect();
            sort_by_score(&mut scored);
            scored.truncate(k);
        }

        if !identifiers.is_empty() {
            let is_hit = |chunk: &Chunk| {
                identifiers
                    .iter()
                    .any(|id| chunk.name.contains(id.as_str()) || chunk.content.contains(id.as_str()))
            };
            for item in &mut scored {
                if is_hit(&item.chunk) {
                    item.score = item.score.max(LITERAL_HIT_SCORE);
                }
            }

            let mut seen: HashSet<String> = scored.iter().map(|s| s.chunk.id.clone()).collect();
            for chunk in &chunks {
                if seen.contains(&chunk.id) {
                    continue;
                }
                if is_hit(chunk) {
                    seen.insert(chunk.id.clone());
                    scored.push(ScoredChunk {
                        chunk: chunk.clone(),
                        score: similarity(chunk).unwrap_or(0.0).max(LITERAL_HIT_SCORE),
                    });
                }
            }
        }

        sort_by_score(&mut scored);
        scored.truncate(k);
        tracing::debug!("Retrieved {} candidates for query", scored.len());
        scored
    }

    /// Replace scores with the rerank service's relevance scores. Without a
    /// service, or when it fails, candidates pass through unchanged.
    pub async fn rerank(&self, query: &str, candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let Some(reranker) = &self.reranker else {
            return candidates;
        };
        if candidates.is_empty() {
            return candidates;
        }

        let documents: Vec<String> = candidates
            .iter()
            .map(|c| truncate_chars(&c.chunk.content, RERANK_DOCUMENT_CHARS).to_string())
            .collect();

        match reranker.rerank(query, &documents, documents.len()).await {
            Ok(results) if !results.is_empty() => {
                let mut used = HashSet::new();
                let mut reranked: Vec<ScoredChunk> = results
                    .into_iter()
                    .filter(|(index, _)| used.insert(*index))
                    .map(|(index, score)| ScoredChunk {
                        chunk: candidates[index].chunk.clone(),
                        score,
                    })
                    .collect();
                sort_by_score(&mut reranked);
                reranked
            }
            Ok(_) => candidates,
            Err(e) => {
                tracing::warn!("Rerank failed, keeping similarity order: {}", e);
                candidates
            }
        }
    }

    /// Append chunks of files referenced by `import … from "X"` / `require("X")`
    /// in the candidates, restricted to files in the candidate's own directory.
    pub async fn expand_context(&self, mut candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let chunks = self.store.chunks().await;
        let mut seen: HashSet<String> = candidates.iter().map(|c| c.chunk.id.clone()).collect();
        let mut added = Vec::new();

        'outer: for candidate in &candidates {
            let Some(dir) = Path::new(&candidate.chunk.file_path).parent() else {
                continue;
            };
            for reference in import_references(&candidate.chunk.content) {
                let Some(needle) = sibling_reference(&reference) else {
                    tracing::trace!("Not following import {} outside {}", reference, dir.display());
                    continue;
                };
                for other in &chunks {
                    if added.len() >= MAX_EXPANSION {
                        break 'outer;
                    }
                    if other.file_path == candidate.chunk.file_path
                        || other.content_type == ContentType::Import
                        || seen.contains(&other.id)
                        || !is_sibling_named(&other.file_path, dir, needle)
                    {
                        continue;
                    }
                    seen.insert(other.id.clone());
                    added.push(ScoredChunk {
                        chunk: other.clone(),
                        score: EXPANSION_SCORE,
                    });
                }
            }
        }

        candidates.extend(added);
        candidates
    }
}

fn sort_by_score(items: &mut [ScoredChunk]) {
    items.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
            .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
    });
}

/// `"name"` / `'name'` occurrences of at least three characters
pub fn quoted_identifiers(query: &str) -> Vec<String> {
    static QUOTED_RE: OnceLock<Regex> = OnceLock::new();
    let re = QUOTED_RE.get_or_init(|| Regex::new(r#""([^"\s]{3,})"|'([^'\s]{3,})'"#).unwrap());

    let mut out: Vec<String> = Vec::new();
    for cap in re.captures_iter(query) {
        if let Some(m) = cap.get(1).or_else(|| cap.get(2)) {
            let ident = m.as_str().to_string();
            if !out.contains(&ident) {
                out.push(ident);
            }
        }
    }
    out
}

pub fn import_references(content: &str) -> Vec<String> {
    static IMPORT_RE: OnceLock<Regex> = OnceLock::new();
    static REQUIRE_RE: OnceLock<Regex> = OnceLock::new();
    let import_re = IMPORT_RE
        .get_or_init(|| Regex::new(r#"import\s+(?:[^'"]*?\s+from\s+)?["']([^"']+)["']"#).unwrap());
    let require_re =
        REQUIRE_RE.get_or_init(|| Regex::new(r#"require\(\s*["']([^"']+)["']\s*\)"#).unwrap());

    import_re
        .captures_iter(content)
        .chain(require_re.captures_iter(content))
        .map(|cap| cap[1].to_string())
        .collect()
}

/// The sibling file an import points at: `./util.js` → `util`. References
/// that leave the directory (`../x`, `./lib/x`, `..`) give `None`.
fn sibling_reference(reference: &str) -> Option<&str> {
    let mut r = reference.trim();
    while let Some(rest) = r.strip_prefix("./") {
        r = rest;
    }
    if r.is_empty() || r == "." || r == ".." || r.contains('/') || r.contains('\\') {
        return None;
    }
    match r.rfind('.') {
        Some(dot) if dot > 0 => Some(&r[..dot]),
        _ => Some(r),
    }
}

fn is_sibling_named(path: &str, dir: &Path, needle: &str) -> bool {
    let path = Path::new(path);
    path.parent() == Some(dir)
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.contains(needle))
}
