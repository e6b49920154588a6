use super::{slice_lines, ContentType, ExtractionStrategy, RawChunk};
use anyhow::Result;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Header lines searched for an opening brace before giving up on a declaration
const MAX_HEADER_LOOKAHEAD: usize = 3;

/// Header regexes plus brace-depth matching for C-family languages
/// (C, C++, Java, C#, Go, Rust, Kotlin, Swift, Scala, PHP).
pub struct BraceStrategy;

struct Patterns {
    type_decl: Regex,
    go_func: Regex,
    keyword_func: Regex,
    c_func: Regex,
    import: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        type_decl: Regex::new(
            r"^\s*(?:(?:pub(?:\([^)]*\))?|public|private|protected|internal|static|abstract|final|sealed|partial|export|data|open|unsafe)\s+)*(class|struct|interface|enum|trait|impl|record|object)\b\s*(?:<[^>]*>\s*)?([A-Za-z_]\w*)",
        )
        .unwrap(),
        go_func: Regex::new(r"^\s*func\s+(?:\([^)]*\)\s*)?([A-Za-z_]\w*)\s*[(\[]").unwrap(),
        keyword_func: Regex::new(
            r"^\s*(?:(?:pub(?:\([^)]*\))?|public|private|protected|internal|static|async|unsafe|const|extern|override|open|final|abstract)\s+)*(?:fn|fun|func|function|def)\s+([A-Za-z_]\w*)",
        )
        .unwrap(),
        c_func: Regex::new(
            r"^\s*(?:[\w:<>,\*&\[\]]+\s+)+[\*&]*([A-Za-z_][\w:~]*)\s*\([^;]*$",
        )
        .unwrap(),
        import: Regex::new(r"^\s*(?:#include\s*[<\x22]([^>\x22]+)|import\s+(?:static\s+)?([\w.\*]+)|using\s+([\w.]+)\s*;|use\s+([\w:{}, \*]+);)").unwrap(),
    })
}

const CONTROL_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "return", "else", "catch", "do", "sizeof", "new", "throw",
    "case", "delete",
];

#[derive(Debug, PartialEq)]
enum Header {
    Type(String),
    Function(String),
    Import(String),
}

fn classify(line: &str) -> Option<Header> {
    let p = patterns();
    if let Some(cap) = p.import.captures(line) {
        let name = (1..=4)
            .find_map(|i| cap.get(i))
            .map_or("", |m| m.as_str())
            .trim()
            .to_string();
        return Some(Header::Import(name));
    }
    if let Some(cap) = p.type_decl.captures(line) {
        return Some(Header::Type(cap[2].to_string()));
    }
    if let Some(cap) = p.go_func.captures(line) {
        return Some(Header::Function(cap[1].to_string()));
    }
    if let Some(cap) = p.keyword_func.captures(line) {
        return Some(Header::Function(cap[1].to_string()));
    }
    if let Some(cap) = p.c_func.captures(line) {
        let name = cap[1].to_string();
        let first_word = line.trim_start().split(|c: char| !c.is_alphanumeric() && c != '_').next().unwrap_or("");
        if CONTROL_KEYWORDS.contains(&name.as_str()) || CONTROL_KEYWORDS.contains(&first_word) {
            return None;
        }
        return Some(Header::Function(name));
    }
    None
}

/// Find the 0-based line where the brace opened at or after `start_idx` closes.
/// Returns `None` when the header has no body (declaration, prototype).
pub fn match_block(lines: &[&str], start_idx: usize) -> Option<usize> {
    let mut depth: i32 = 0;
    let mut opened = false;
    let mut in_block_comment = false;

    for (idx, line) in lines.iter().enumerate().skip(start_idx) {
        if !opened && idx > start_idx + MAX_HEADER_LOOKAHEAD {
            return None;
        }
        let mut chars = line.chars().peekable();
        let mut in_string: Option<char> = None;
        while let Some(c) = chars.next() {
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
                continue;
            }
            if let Some(quote) = in_string {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '"' | '\'' | '`' => in_string = Some(c),
                '/' if chars.peek() == Some(&'/') => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    in_block_comment = true;
                }
                ';' if !opened && depth == 0 => return None,
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => {
                    depth -= 1;
                    if opened && depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

impl ExtractionStrategy for BraceStrategy {
    fn tag(&self) -> &'static str {
        "brace"
    }

    fn extract(&self, _file_path: &Path, content: &str) -> Result<Vec<RawChunk>> {
        let lines: Vec<&str> = content.lines().collect();
        let mut chunks = Vec::new();
        // End lines (1-based) of open type and function blocks
        let mut type_ends: Vec<usize> = Vec::new();
        let mut function_end: usize = 0;

        for (idx, line) in lines.iter().enumerate() {
            let line_no = idx + 1;
            type_ends.retain(|end| line_no <= *end);
            if line_no <= function_end {
                continue;
            }

            let Some(header) = classify(line) else {
                continue;
            };

            match header {
                Header::Import(name) => chunks.push(RawChunk {
                    content_type: ContentType::Import,
                    name,
                    start_line: line_no,
                    end_line: line_no,
                    content: line.to_string(),
                }),
                Header::Type(name) => {
                    let Some(end_idx) = match_block(&lines, idx) else {
                        continue;
                    };
                    let end = end_idx + 1;
                    let content_type = if line.contains("interface") || line.contains("trait") {
                        ContentType::Interface
                    } else {
                        ContentType::Class
                    };
                    chunks.push(RawChunk {
                        content_type,
                        name,
                        start_line: line_no,
                        end_line: end,
                        content: slice_lines(&lines, line_no, end),
                    });
                    type_ends.push(end);
                }
                Header::Function(name) => {
                    let Some(end_idx) = match_block(&lines, idx) else {
                        continue;
                    };
                    let end = end_idx + 1;
                    let content_type = if type_ends.is_empty() {
                        ContentType::Function
                    } else {
                        ContentType::Method
                    };
                    chunks.push(RawChunk {
                        content_type,
                        name,
                        start_line: line_no,
                        end_line: end,
                        content: slice_lines(&lines, line_no, end),
                    });
                    function_end = end;
                }
            }
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_struct_impl_and_functions() {
        let code = r#"use std::fmt;

pub struct Point {
    x: i32,
}

impl Point {
    pub fn new(x: i32) -> Self {
        Self { x }
    }
}

fn main() {
    let p = Point::new(1);
    if p.x > 0 {
        println!("{}", "}");
    }
}
"#;
        let chunks = BraceStrategy.extract(Path::new("main.rs"), code).unwrap();
        let summary: Vec<_> = chunks
            .iter()
            .map(|c| (c.content_type, c.name.as_str(), c.start_line, c.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ContentType::Import, "std::fmt", 1, 1),
                (ContentType::Class, "Point", 3, 5),
                (ContentType::Class, "Point", 7, 11),
                (ContentType::Method, "new", 8, 10),
                (ContentType::Function, "main", 13, 18),
            ]
        );
    }

    #[test]
    fn test_c_prototypes_are_skipped() {
        let code = "#include <stdio.h>\nint add(int a, int b);\n\nint add(int a, int b)\n{\n    return a + b;\n}\n";
        let chunks = BraceStrategy.extract(Path::new("add.c"), code).unwrap();
        let summary: Vec<_> = chunks
            .iter()
            .map(|c| (c.content_type, c.name.as_str(), c.start_line, c.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ContentType::Import, "stdio.h", 1, 1),
                (ContentType::Function, "add", 4, 7),
            ]
        );
    }

    #[test]
    fn test_go_method_receiver() {
        let code = "package main\n\nfunc (s *Server) Start() error {\n\treturn nil\n}\n";
        let chunks = BraceStrategy.extract(Path::new("s.go"), code).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].name, "Start");
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (3, 5));
    }
}
