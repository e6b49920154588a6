//! Tool selection for steps whose tool or arguments are missing.
//!
//! The model is asked for a single JSON object; the reply is parsed leniently
//! (fences, alternate key names, unescaped quotes inside spec fields). When
//! that fails a keyword heuristic over the step text picks the tool.

use super::tools::ToolDef;
use crate::planner::plan::{Args, Step};
use crate::planner::validate::clean_json;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Tool is known, only its arguments are missing
    ArgsOnly,
    /// Pick a tool from the whole registry
    Auto,
}

/// Result of parsing a selection reply
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub tool: Option<String>,
    pub args: Args,
}

pub fn selection_prompt(step: &Step, context: &str, mode: SelectionMode, tools: &[ToolDef]) -> String {
    let step_json = serde_json::to_string_pretty(step).unwrap_or_default();
    let mut prompt = String::new();
    match mode {
        SelectionMode::ArgsOnly => {
            prompt.push_str("Fill in the arguments for the tool this step uses.\n\n");
        }
        SelectionMode::Auto => {
            prompt.push_str("Choose the single best tool for this step and its arguments.\n\n");
        }
    }
    prompt.push_str(&format!("# Step\n{}\n", step_json));
    if !context.trim().is_empty() {
        prompt.push_str(&format!("\n# Recent context\n{}\n", context.trim()));
    }
    prompt.push_str("\n# Tools\n");
    for tool in tools {
        prompt.push_str(&format!("- {}: {}\n  args: {}\n", tool.name, tool.description, tool.schema));
    }
    prompt.push_str(
        "\nRespond with ONE line of JSON and nothing else: {\"tool\": \"<name>\", \"args\": {...}}. \
         Describe any code in natural language in *_spec fields; never write code.",
    );
    prompt
}

/// Parse a selection reply; a sanitized second attempt follows a failed parse
pub fn parse_selection(text: &str) -> Option<Selection> {
    let cleaned = clean_json(text);
    let value = serde_json::from_str::<Value>(&cleaned)
        .or_else(|_| serde_json::from_str::<Value>(&sanitize_selection_json(&cleaned)))
        .ok()?;
    let obj = value.as_object()?;

    let function_call = obj.get("function_call");
    let tool = ["tool", "tool_name", "name", "action"]
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| function_call.and_then(|f| f.get("name")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let args = ["args", "tool_args", "parameters", "arguments", "input"]
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| function_call.and_then(|f| f.get("arguments")))
        .and_then(|v| match v {
            Value::Object(map) => Some(map.clone()),
            // function-call style arguments arrive as a JSON string
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .and_then(|v| v.as_object().cloned()),
            _ => None,
        });

    if tool.is_none() && args.is_none() {
        return None;
    }
    Some(Selection {
        tool,
        args: args.unwrap_or_default(),
    })
}

/// Repair common malformations: embedded code fences, raw control characters
/// inside strings, and unescaped quotes inside `*_spec` values (a quote ends
/// such a value only when followed by `,` or `}`).
pub fn sanitize_selection_json(text: &str) -> String {
    let text = text.replace("```", "'''");
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut last_string = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != '"' {
            out.push(c);
            i += 1;
            continue;
        }

        let lenient = out.trim_end().ends_with(':') && last_string.ends_with("_spec");
        let mut current = String::new();
        out.push('"');
        i += 1;
        while i < chars.len() {
            let c = chars[i];
            match c {
                '\\' => {
                    out.push('\\');
                    if let Some(&next) = chars.get(i + 1) {
                        out.push(next);
                        current.push(next);
                    }
                    i += 2;
                    continue;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                '"' if lenient => {
                    let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                    if matches!(next, None | Some(',') | Some('}')) {
                        break;
                    }
                    out.push_str("\\\"");
                }
                '"' => break,
                _ => out.push(c),
            }
            current.push(c);
            i += 1;
        }
        out.push('"');
        i += 1;
        last_string = current;
    }
    out
}

struct Rule {
    tool: &'static str,
    pattern: &'static str,
}

const RULES: &[Rule] = &[
    Rule { tool: "create_directory", pattern: r"\bmkdir\b|\bcreate\s+(?:a\s+|the\s+|new\s+)*(?:directory|folder)\b" },
    Rule { tool: "create_file", pattern: r"\bcreate\b|\bnew\s+file\b|\badd\s+(?:a\s+|the\s+)?(?:new\s+)?file\b|\bscaffold\b" },
    Rule { tool: "append_file", pattern: r"\bappend\b" },
    Rule {
        tool: "edit_file",
        pattern: r"\b(?:edit|modify|update|change|fix|refactor|implement|replace|add)\b|\bremove\s.+\sfrom\b",
    },
    Rule { tool: "read_file", pattern: r"\b(?:read|open|view|inspect|show)\b" },
    Rule { tool: "delete_path", pattern: r"\b(?:delete|remove)\b" },
    Rule { tool: "move_path", pattern: r"\b(?:rename|move)\b" },
    Rule { tool: "copy_path", pattern: r"\b(?:copy|duplicate)\b" },
    Rule { tool: "list_directory", pattern: r"\blist\b" },
    Rule { tool: "locate_code", pattern: r"\blocate\b" },
    Rule { tool: "search_text", pattern: r"\b(?:search|find|grep|look\s+for)\b" },
    Rule { tool: "run_command", pattern: r"\b(?:run|execute|install|test|build|compile)\b" },
    Rule { tool: "format_file", pattern: r"\b(?:format|prettify)\b" },
];

fn rules() -> &'static [(Regex, &'static str)] {
    static COMPILED: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .map(|r| (Regex::new(r.pattern).unwrap(), r.tool))
            .collect()
    })
}

/// Keyword fallback. The action is matched first, then the full description.
pub fn heuristic_tool(step: &Step) -> Option<(String, Args)> {
    let action = step.action.to_lowercase();
    let description = step.description().to_lowercase();
    let tool = [action, description].iter().find_map(|text| {
        rules()
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, tool)| *tool)
    })?;
    Some((tool.to_string(), heuristic_args(tool, step)))
}

/// Best-effort arguments for `tool` from the step's own fields
pub fn heuristic_args(tool: &str, step: &Step) -> Args {
    let mut args = step.args.clone().unwrap_or_default();
    let files = &step.files_to_edit;
    let mut set = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            args.entry(key.to_string()).or_insert(Value::String(value));
        }
    };

    match tool {
        "move_path" | "copy_path" => {
            set("from", files.first().cloned());
            set("to", files.get(1).cloned());
        }
        "list_directory" => set("path", Some(files.first().cloned().unwrap_or_else(|| ".".to_string()))),
        _ => set("path", files.first().cloned()),
    }
    match tool {
        "create_file" | "append_file" => set("content_spec", Some(step.action.clone())),
        "edit_file" => set("edit_spec", Some(step.action.clone())),
        "run_command" => set("command", backticked(&step.action)),
        "search_text" => set(
            "query",
            Some(backticked(&step.action).unwrap_or_else(|| step.action.clone())),
        ),
        "locate_code" => set("name", backticked(&step.action)),
        _ => {}
    }
    args
}

fn backticked(text: &str) -> Option<String> {
    static TICK_RE: OnceLock<Regex> = OnceLock::new();
    let re = TICK_RE.get_or_init(|| Regex::new(r"`([^`]+)`").unwrap());
    re.captures(text).map(|c| c[1].to_string())
}

/// Compact selection record for logs
pub fn describe(tool: &str, args: &Args) -> Value {
    json!({"tool": tool, "args": args})
}
