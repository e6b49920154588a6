use super::{slice_lines, ContentType, ExtractionStrategy, RawChunk};
use anyhow::Result;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Line-scanning block detection for Python. A block runs from its header to the
/// last following non-blank line indented deeper than the header.
pub struct IndentStrategy;

struct Patterns {
    def: Regex,
    class: Regex,
    import: Regex,
    assign: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        def: Regex::new(r"^(\s*)(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").unwrap(),
        class: Regex::new(r"^(\s*)class\s+([A-Za-z_]\w*)").unwrap(),
        import: Regex::new(r"^(?:import\s+([\w.]+)|from\s+([\w.]+)\s+import\b)").unwrap(),
        assign: Regex::new(r"^([A-Za-z_]\w*)\s*(?::[^=]+)?=[^=]").unwrap(),
    })
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// Last line (1-based) of the block whose header sits at `header_idx` (0-based)
fn block_end(lines: &[&str], header_idx: usize) -> usize {
    let header_indent = indent_of(lines[header_idx]);
    let mut end = header_idx;
    for (idx, line) in lines.iter().enumerate().skip(header_idx + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= header_indent {
            break;
        }
        end = idx;
    }
    end + 1
}

impl ExtractionStrategy for IndentStrategy {
    fn tag(&self) -> &'static str {
        "python-indent"
    }

    fn extract(&self, _file_path: &Path, content: &str) -> Result<Vec<RawChunk>> {
        let p = patterns();
        let lines: Vec<&str> = content.lines().collect();
        let mut chunks = Vec::new();
        // (indent, end line) of enclosing classes
        let mut class_stack: Vec<(usize, usize)> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let line_no = idx + 1;
            let indent = indent_of(line);
            class_stack.retain(|(class_indent, end)| line_no <= *end && indent > *class_indent);

            if let Some(cap) = p.class.captures(line) {
                let end = block_end(&lines, idx);
                chunks.push(RawChunk {
                    content_type: ContentType::Class,
                    name: cap[2].to_string(),
                    start_line: line_no,
                    end_line: end,
                    content: slice_lines(&lines, line_no, end),
                });
                class_stack.push((indent, end));
            } else if let Some(cap) = p.def.captures(line) {
                let end = block_end(&lines, idx);
                let content_type = if class_stack.is_empty() {
                    ContentType::Function
                } else {
                    ContentType::Method
                };
                chunks.push(RawChunk {
                    content_type,
                    name: cap[2].to_string(),
                    start_line: line_no,
                    end_line: end,
                    content: slice_lines(&lines, line_no, end),
                });
            } else if let Some(cap) = p.import.captures(line) {
                let module = cap.get(1).or_else(|| cap.get(2)).map_or("", |m| m.as_str());
                chunks.push(RawChunk {
                    content_type: ContentType::Import,
                    name: module.to_string(),
                    start_line: line_no,
                    end_line: line_no,
                    content: line.to_string(),
                });
            } else if let Some(cap) = p.assign.captures(line) {
                let end = block_end(&lines, idx);
                chunks.push(RawChunk {
                    content_type: ContentType::Variable,
                    name: cap[1].to_string(),
                    start_line: line_no,
                    end_line: end,
                    content: slice_lines(&lines, line_no, end),
                });
            }
        }

        Ok(chunks)
    }
}
