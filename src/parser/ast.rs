use super::{ContentType, ExtractionStrategy, RawChunk};
use anyhow::{Context, Result};
use std::path::Path;
use tree_sitter::{Language, Node, Parser};

/// Tree-sitter walk for JavaScript / TypeScript: one chunk per function, class,
/// method, interface, import and top-level variable.
pub struct TreeSitterStrategy;

impl TreeSitterStrategy {
    fn language_for(file_path: &Path) -> Language {
        match file_path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "ts" | "mts" | "cts" => tree_sitter_typescript::language_typescript(),
            "tsx" => tree_sitter_typescript::language_tsx(),
            // The JavaScript grammar covers JSX
            _ => tree_sitter_javascript::language(),
        }
    }
}

impl ExtractionStrategy for TreeSitterStrategy {
    fn tag(&self) -> &'static str {
        "ts-ast"
    }

    fn extract(&self, file_path: &Path, content: &str) -> Result<Vec<RawChunk>> {
        let mut parser = Parser::new();
        parser
            .set_language(Self::language_for(file_path))
            .context("Failed to set language")?;

        let tree = parser
            .parse(content, None)
            .context("Failed to parse code")?;

        let mut chunks = Vec::new();
        visit(tree.root_node(), content, true, &mut chunks);
        Ok(chunks)
    }
}

fn visit(node: Node, source: &str, top_level: bool, chunks: &mut Vec<RawChunk>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "export_statement" => visit(child, source, top_level, chunks),
            "import_statement" if top_level => {
                let name = child
                    .child_by_field_name("source")
                    .map(|s| node_text(s, source).trim_matches(|c| c == '"' || c == '\'').to_string())
                    .unwrap_or_else(|| "import".to_string());
                chunks.push(make_chunk(child, source, ContentType::Import, name));
            }
            "function_declaration" | "generator_function_declaration" => {
                let name = field_text(child, "name", source);
                chunks.push(make_chunk(child, source, ContentType::Function, name));
            }
            "class_declaration" | "abstract_class_declaration" => {
                let name = field_text(child, "name", source);
                chunks.push(make_chunk(child, source, ContentType::Class, name));
                if let Some(body) = child.child_by_field_name("body") {
                    visit_class_body(body, source, chunks);
                }
            }
            "interface_declaration" | "type_alias_declaration" => {
                let name = field_text(child, "name", source);
                chunks.push(make_chunk(child, source, ContentType::Interface, name));
            }
            "lexical_declaration" | "variable_declaration" if top_level => {
                if let Some(chunk) = variable_chunk(child, source) {
                    chunks.push(chunk);
                }
            }
            _ => {}
        }
    }
}

fn visit_class_body(body: Node, source: &str, chunks: &mut Vec<RawChunk>) {
    let mut cursor = body.walk();
    for member in body.named_children(&mut cursor) {
        if member.kind() == "method_definition" {
            let name = field_text(member, "name", source);
            chunks.push(make_chunk(member, source, ContentType::Method, name));
        }
    }
}

/// `const x = ...`; arrow functions and function expressions count as functions
fn variable_chunk(node: Node, source: &str) -> Option<RawChunk> {
    let mut cursor = node.walk();
    let declarator = node
        .named_children(&mut cursor)
        .find(|c| c.kind() == "variable_declarator")?;

    let name = field_text(declarator, "name", source);
    let content_type = match declarator.child_by_field_name("value").map(|v| v.kind()) {
        Some("arrow_function") | Some("function") | Some("function_expression")
        | Some("generator_function") => ContentType::Function,
        Some("class") => ContentType::Class,
        _ => ContentType::Variable,
    };
    Some(make_chunk(node, source, content_type, name))
}

fn make_chunk(node: Node, source: &str, content_type: ContentType, name: String) -> RawChunk {
    RawChunk {
        content_type,
        name,
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        content: node_text(node, source).to_string(),
    }
}

fn field_text(node: Node, field: &str, source: &str) -> String {
    node.child_by_field_name(field)
        .map(|n| node_text(n, source).to_string())
        .unwrap_or_default()
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}
