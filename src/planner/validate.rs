//! Plan response parsing, validation and sanitization.

use super::plan::{Args, Plan, Step, ToolCall};
use crate::error::{AgentError, AgentResult};
use crate::llm::strip_code_fences;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Literal-code argument fields, rewritten to `<field>_spec` whatever the
/// step's tool. Only the file-mutating tools read them, and an `auto` step may
/// still resolve to one of those.
const CODE_FIELDS: &[&str] = &["content", "snippet", "replace", "find", "code"];

/// Strip fences and surrounding prose, keeping the outermost `{ ... }`
pub fn clean_json(text: &str) -> String {
    let unfenced = strip_code_fences(text);
    let trimmed = unfenced.trim();
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => trimmed[start..=end].to_string(),
        _ => trimmed.to_string(),
    }
}

/// Parse and validate a model response into a plan, then sanitize it
pub fn parse_plan(text: &str) -> AgentResult<Plan> {
    let cleaned = clean_json(text);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| AgentError::structural(format!("Response is not valid JSON: {}", e)))?;

    let raw_steps = value
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| AgentError::structural("Missing `steps` array"))?;

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (i, raw) in raw_steps.iter().enumerate() {
        steps.push(parse_step(i, raw)?);
    }

    let mut plan = Plan { steps };
    plan.renumber();
    sanitize_plan(&mut plan);
    Ok(plan)
}

fn parse_step(index: usize, raw: &Value) -> AgentResult<Step> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AgentError::structural(format!("Step {} is not an object", index + 1)))?;

    if !obj.get("step").map_or(false, Value::is_number) {
        return Err(AgentError::structural(format!(
            "Step {} is missing a numeric `step`",
            index + 1
        )));
    }
    let required = |field: &str| -> AgentResult<String> {
        obj.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                AgentError::structural(format!("Step {} is missing string `{}`", index + 1, field))
            })
    };
    let action = required("action")?;
    let thought = required("thought")?;

    let tool = obj
        .get("tool")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let tool_calls = obj
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let name = call.get("tool").and_then(Value::as_str)?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    Some(ToolCall {
                        tool: name.to_string(),
                        args: call
                            .get("args")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let files_to_edit = match obj.get("files_to_edit") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    };

    let optional = |field: &str| obj.get(field).and_then(Value::as_str).map(str::to_string);

    Ok(Step {
        step: index + 1,
        action,
        thought,
        ui_text: optional("ui_text"),
        tool,
        args: obj.get("args").and_then(Value::as_object).cloned(),
        tool_calls,
        files_to_edit,
        notes: optional("notes"),
    })
}

/// Move literal-code fields to `*_spec` and drop any spec that still looks like code
pub fn sanitize_plan(plan: &mut Plan) {
    for step in &mut plan.steps {
        sanitize_step(step);
    }
}

/// Sanitize a step's own args and every tool call it carries
pub fn sanitize_step(step: &mut Step) {
    let tool = step.tool.as_deref().unwrap_or("auto");
    if let Some(args) = step.args.as_mut() {
        sanitize_args(tool, args);
    }
    for call in &mut step.tool_calls {
        sanitize_args(&call.tool, &mut call.args);
    }
}

pub fn sanitize_args(tool: &str, args: &mut Args) {
    for field in CODE_FIELDS {
        let Some(value) = args.remove(*field) else {
            continue;
        };
        let spec_key = format!("{}_spec", field);
        if let Value::String(text) = value {
            args.entry(spec_key).or_insert(Value::String(text));
        }
    }

    let dropped: Vec<String> = args
        .iter()
        .filter(|(key, value)| {
            key.ends_with("_spec") && value.as_str().map_or(false, looks_like_code)
        })
        .map(|(key, _)| key.clone())
        .collect();
    for key in dropped {
        tracing::debug!("Dropping code-like `{}` from {} args", key, tool);
        args.remove(&key);
    }
}

/// Heuristic: fenced blocks, multi-line text with braces or semicolons, or
/// declaration-shaped keyword patterns
pub fn looks_like_code(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    let has_code_punctuation = text.contains('{') || text.contains('}') || text.contains(';');
    if text.contains('\n') && has_code_punctuation {
        return true;
    }
    if text.contains('{') && text.contains('}') && text.contains(';') {
        return true;
    }

    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"\b(?:function|def|fn|func)\s+[A-Za-z_$][\w$]*\s*\(",
            r"\bclass\s+[A-Za-z_$][\w$]*\s*[({:]",
            r"\b(?:const|let|var)\s+[A-Za-z_$][\w$]*\s*=",
            r#"\bimport\s+[\w{}*,\s]+\s+from\s+['"]"#,
            r#"#include\s*[<"]"#,
            r"=>\s*[{(]",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    patterns.iter().any(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_fenced_response_with_prose_is_parsed() {
        let text = "Here is the plan:\n```json\n{\"steps\": [{\"step\": 7, \"action\": \"Read config\", \"thought\": \"Need context\", \"tool\": \"read_file\", \"args\": {\"path\": \"src/config.ts\"}}, {\"step\": 9, \"action\": \"Edit\", \"thought\": \"Apply\", \"tool\": \"  \"}]}\n```";
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps[0].step, 1);
        assert_eq!(plan.steps[1].step, 2);
        assert_eq!(plan.steps[0].tool.as_deref(), Some("read_file"));
        assert_eq!(plan.steps[1].tool, None);
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(parse_plan("not json"), Err(AgentError::Structural(_))));
        assert!(matches!(
            parse_plan("{\"plan\": []}"),
            Err(AgentError::Structural(ref m)) if m.contains("steps")
        ));
        assert!(matches!(
            parse_plan("{\"steps\": [{\"step\": \"1\", \"action\": \"a\", \"thought\": \"b\"}]}"),
            Err(AgentError::Structural(_))
        ));
        assert!(matches!(
            parse_plan("{\"steps\": [{\"step\": 1, \"action\": \"a\"}]}"),
            Err(AgentError::Structural(ref m)) if m.contains("thought")
        ));
    }

    #[test]
    fn test_empty_tool_calls_are_dropped() {
        let text = json!({"steps": [{"step": 1, "action": "a", "thought": "b",
            "tool_calls": [{"tool": " "}, {"tool": "list_directory", "args": {"path": "."}}]}]})
        .to_string();
        let plan = parse_plan(&text).unwrap();
        assert_eq!(plan.steps[0].tool_calls.len(), 1);
        assert_eq!(plan.steps[0].tool_calls[0].tool, "list_directory");
    }

    #[test]
    fn test_code_fields_become_specs() {
        let text = json!({"steps": [{"step": 1, "action": "Create helper", "thought": "t",
            "tool": "create_file",
            "args": {"path": "src/helper.ts", "content": "A helper exporting a slugify utility"}}]})
        .to_string();
        let plan = parse_plan(&text).unwrap();
        let args = plan.steps[0].args.as_ref().unwrap();
        assert!(args.get("content").is_none());
        assert_eq!(args["content_spec"], "A helper exporting a slugify utility");
    }

    #[test]
    fn test_auto_and_toolless_steps_lose_literal_code() {
        let text = json!({"steps": [
            {"step": 1, "action": "Create h.js", "thought": "t", "tool": "auto",
             "args": {"path": "h.js", "content": "function x() {\n  return 1;\n}"}},
            {"step": 2, "action": "Add a constant", "thought": "t",
             "args": {"path": "c.js", "code": "```js\nconst a = 1;\n```", "snippet": "A constant named a set to one"}},
            {"step": 3, "action": "Append", "thought": "t",
             "tool_calls": [{"tool": "some_plugin", "args": {"content": "let y = 2;"}}]}
        ]})
        .to_string();
        let plan = parse_plan(&text).unwrap();

        let first = plan.steps[0].args.as_ref().unwrap();
        assert!(first.get("content").is_none());
        assert!(first.get("content_spec").is_none());
        assert_eq!(first["path"], "h.js");

        let second = plan.steps[1].args.as_ref().unwrap();
        assert!(second.get("code").is_none());
        assert!(second.get("code_spec").is_none());
        assert_eq!(second["snippet_spec"], "A constant named a set to one");

        let call = &plan.steps[2].tool_calls[0].args;
        assert!(call.is_empty(), "{:?}", call);
    }

    #[test]
    fn test_sanitize_step_covers_args_and_calls() {
        let mut step: Step = serde_json::from_value(json!({
            "step": 1, "action": "a", "thought": "b",
            "args": {"content": "A short greeting"},
            "tool_calls": [{"tool": "create_file", "args": {"content": "if (a) {\n}"}}]
        }))
        .unwrap();
        sanitize_step(&mut step);
        assert_eq!(step.args.as_ref().unwrap()["content_spec"], "A short greeting");
        assert!(step.tool_calls[0].args.is_empty());
    }

    #[test]
    fn test_code_like_specs_never_survive() {
        let samples = [
            "```ts\nexport const x = 1;\n```",
            "if (ready) {\n  start();\n}",
            "function greet(name) { return 'hi ' + name; }",
            "const total = items.length",
            "def handler(event):",
            "import { useState } from 'react'",
        ];
        for sample in samples {
            let text = json!({"steps": [{"step": 1, "action": "a", "thought": "b",
                "tool": "edit_file",
                "args": {"path": "x", "replace": sample, "edit_spec": sample}}]})
            .to_string();
            let plan = parse_plan(&text).unwrap();
            let serialized = serde_json::to_string(&plan).unwrap();
            assert!(
                !serialized.contains(&serde_json::to_string(sample).unwrap()),
                "code leaked: {}",
                sample
            );
        }
    }

    #[test]
    fn test_prose_is_not_code() {
        assert!(!looks_like_code("Add a function that validates the email field"));
        assert!(!looks_like_code("Rename the class to UserService and update callers"));
        assert!(looks_like_code("let x = 5"));
    }
}
