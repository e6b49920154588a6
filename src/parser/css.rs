use super::{line_at, ContentType, ExtractionStrategy, RawChunk};
use anyhow::Result;
use std::path::Path;

/// Top-level rule walk: each `selector { ... }` (including at-rule blocks) at
/// depth zero becomes one chunk named after its selector.
pub struct CssStrategy;

impl ExtractionStrategy for CssStrategy {
    fn tag(&self) -> &'static str {
        "css"
    }

    fn extract(&self, _file_path: &Path, content: &str) -> Result<Vec<RawChunk>> {
        let bytes = content.as_bytes();
        let mut chunks = Vec::new();
        let mut depth: usize = 0;
        // Start of the current selector text at depth zero
        let mut rule_start: Option<usize> = None;
        let mut block_open = 0usize;
        let mut i = 0usize;

        while i < bytes.len() {
            let b = bytes[i];
            if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
                i = content[i + 2..]
                    .find("*/")
                    .map(|end| i + 2 + end + 2)
                    .unwrap_or(bytes.len());
                continue;
            }
            if (b == b'"' || b == b'\'') && depth > 0 {
                i += 1;
                while i < bytes.len() && bytes[i] != b {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                i += 1;
                continue;
            }

            match b {
                b'{' => {
                    if depth == 0 {
                        block_open = i;
                    }
                    depth += 1;
                }
                b'}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        let start = rule_start.take().unwrap_or(block_open);
                        let name = content[start..block_open].trim().to_string();
                        chunks.push(RawChunk {
                            content_type: ContentType::CssRule,
                            name,
                            start_line: line_at(content, start),
                            end_line: line_at(content, i),
                            content: content[start..=i].to_string(),
                        });
                    }
                }
                b';' if depth == 0 => rule_start = None,
                c if depth == 0 && rule_start.is_none() && !c.is_ascii_whitespace() => {
                    rule_start = Some(i);
                }
                _ => {}
            }
            i += 1;
        }

        Ok(chunks)
    }
}
