//! File-writing tools. Code is generated from natural-language specs at
//! execution time; plans never carry it.

use super::{bool_arg, display_path, require_str, resolve_path, str_arg, ToolContext};
use crate::executor::range::{resolve_edit_range, EditRange, RangeInputs, RangeOrigin};
use crate::executor::session::Session;
use crate::llm::{strip_code_fences, ChatMessage};
use crate::parser::truncate_chars;
use crate::planner::plan::{Args, Step};
use crate::planner::validate::clean_json;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use tokio::fs;

const CODE_SYSTEM_PROMPT: &str = "You are a careful software engineer editing a code base. \
    Output only the requested text with no explanations and no markdown fences.";

/// File context handed to the model alongside a targeted edit
const MAX_CONTEXT_CHARS: usize = 12_000;

async fn generate(ctx: &ToolContext<'_>, prompt: String) -> Result<String> {
    let messages = [ChatMessage::system(CODE_SYSTEM_PROMPT), ChatMessage::user(prompt)];
    let reply = ctx.models.chat.generate_chat(&messages, None, ctx.cancel).await?;
    Ok(reply)
}

/// Drop surrounding fences and one trailing newline
pub fn clean_replacement(reply: &str) -> String {
    let text = strip_code_fences(reply);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    text.strip_suffix('\r').unwrap_or(text).to_string()
}

fn spec_text(args: &Args, keys: &[&str], step: &Step) -> String {
    str_arg(args, keys)
        .map(str::to_string)
        .unwrap_or_else(|| step.action.clone())
}

fn with_trailing_newline(mut text: String) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn append_text(content: &str, addition: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(addition.trim_end_matches('\n'));
    out.push('\n');
    out
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub async fn create_file(
    args: &Args,
    step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
) -> Result<String> {
    let path = resolve_path(ctx.root(), require_str(args, &["path", "file"])?);
    let rel = display_path(ctx.root(), &path);
    if path.is_file() && !bool_arg(args, "overwrite").unwrap_or(false) {
        bail!("File already exists: {} (use edit_file, or set overwrite)", rel);
    }

    let content = match args.get("content").and_then(Value::as_str) {
        Some(literal) => literal.to_string(),
        None => {
            let spec = spec_text(args, &["content_spec", "snippet_spec", "code_spec"], step);
            let prompt = format!(
                "Create the file `{}`.\n\nIt should contain: {}\n\nTask: {}\n\n\
                 Return ONLY the complete file contents.",
                rel, spec, step.action
            );
            clean_replacement(&generate(ctx, prompt).await?)
        }
    };
    let content = with_trailing_newline(content);

    write_file(&path, &content).await?;
    session.touch(&path);
    Ok(format!("Created {} ({} lines)", rel, content.lines().count()))
}

pub async fn append_file(
    args: &Args,
    step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
) -> Result<String> {
    let path = resolve_path(ctx.root(), require_str(args, &["path", "file"])?);
    let rel = display_path(ctx.root(), &path);
    let existing = if path.is_file() {
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", rel))?
    } else {
        String::new()
    };

    let addition = match args.get("content").and_then(Value::as_str) {
        Some(literal) => literal.to_string(),
        None => {
            let spec = spec_text(args, &["content_spec", "snippet_spec", "code_spec"], step);
            let tail_start = existing.len().saturating_sub(4000);
            let tail_start = (tail_start..=existing.len())
                .find(|i| existing.is_char_boundary(*i))
                .unwrap_or(existing.len());
            let prompt = format!(
                "Write text to append to the end of `{}`.\n\nIt should contain: {}\n\n\
                 End of the current file:\n```\n{}\n```\n\nReturn ONLY the text to append.",
                rel,
                spec,
                &existing[tail_start..]
            );
            clean_replacement(&generate(ctx, prompt).await?)
        }
    };

    write_file(&path, &append_text(&existing, &addition)).await?;
    session.touch(&path);
    Ok(format!("Appended {} lines to {}", addition.lines().count(), rel))
}

pub async fn edit_file(
    args: &Args,
    step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
) -> Result<String> {
    let path = resolve_path(ctx.root(), require_str(args, &["path", "file"])?);
    let rel = display_path(ctx.root(), &path);
    if !path.is_file() {
        bail!("File not found: {} (use create_file for new files)", rel);
    }
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", rel))?;
    let instruction = spec_text(
        args,
        &["edit_spec", "instruction", "snippet_spec", "code_spec", "content_spec", "replace_spec"],
        step,
    );

    let range = resolve_edit_range(&RangeInputs {
        path: &path,
        content: &content,
        args,
        instruction: &instruction,
        saved: &session.saved_locations,
        retrieved: &session.retrieved,
        focus: session.focus.as_ref(),
    });
    let (start_line, end_line) = range.lines(&content);
    tracing::debug!("edit_file {} resolved {:?} (lines {}-{})", rel, range.origin, start_line, end_line);

    let reply = generate(ctx, edit_prompt(&rel, &content, &range, &instruction)).await?;
    let replacement = clean_replacement(&reply);

    let updated = match range.origin {
        RangeOrigin::Append => append_text(&content, &replacement),
        RangeOrigin::WholeFile => with_trailing_newline(replacement),
        _ => format!("{}{}{}", &content[..range.start], replacement, &content[range.end..]),
    };

    write_file(&path, &updated).await?;
    session.touch(&path);
    Ok(match range.origin {
        RangeOrigin::Append => format!("Appended to {}", rel),
        RangeOrigin::WholeFile => format!("Rewrote {}", rel),
        origin => format!("Edited {} lines {}-{} ({:?})", rel, start_line, end_line, origin),
    })
}

fn edit_prompt(rel: &str, content: &str, range: &EditRange, instruction: &str) -> String {
    let file = truncate_chars(content, MAX_CONTEXT_CHARS);
    match range.origin {
        RangeOrigin::Append => format!(
            "Write code to add at the end of `{}`.\n\nInstruction: {}\n\nCurrent file:\n```\n{}\n```\n\n\
             Return ONLY the new code to append.",
            rel, instruction, file
        ),
        RangeOrigin::WholeFile => format!(
            "Rewrite the file `{}`.\n\nInstruction: {}\n\nCurrent file:\n```\n{}\n```\n\n\
             Return ONLY the complete new file contents.",
            rel, instruction, file
        ),
        _ => {
            let (start, end) = range.lines(content);
            format!(
                "Edit lines {}-{} of `{}`.\n\nInstruction: {}\n\nTarget section:\n```\n{}\n```\n\n\
                 Whole file for reference:\n```\n{}\n```\n\n\
                 Return ONLY the replacement text for the target section.",
                start,
                end,
                rel,
                instruction,
                &content[range.start..range.end],
                file
            )
        }
    }
}

pub async fn replace_in_file(
    args: &Args,
    step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
) -> Result<String> {
    let path = resolve_path(ctx.root(), require_str(args, &["path", "file"])?);
    let rel = display_path(ctx.root(), &path);
    if !path.is_file() {
        bail!("File not found: {}", rel);
    }
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", rel))?;

    let literal = (
        str_arg(args, &["find", "search"]),
        args.get("replace").and_then(Value::as_str),
    );
    let (find, replace) = match literal {
        (Some(find), Some(replace)) => (find.to_string(), replace.to_string()),
        _ => materialize_find_replace(args, step, &rel, &content, ctx).await?,
    };

    let use_regex = bool_arg(args, "regex").unwrap_or(false);
    let all = bool_arg(args, "all").unwrap_or(true);
    let (updated, count) = if use_regex {
        let re = Regex::new(&find).with_context(|| format!("Invalid regex: {}", find))?;
        let count = re.find_iter(&content).count();
        let updated = if all {
            re.replace_all(&content, replace.as_str())
        } else {
            re.replace(&content, replace.as_str())
        };
        (updated.into_owned(), count)
    } else {
        let count = content.matches(find.as_str()).count();
        let updated = if all {
            content.replace(&find, &replace)
        } else {
            content.replacen(&find, &replace, 1)
        };
        (updated, count)
    };

    if count == 0 {
        bail!("Text to replace not found in {}", rel);
    }
    write_file(&path, &updated).await?;
    session.touch(&path);
    Ok(format!(
        "Replaced {} occurrence(s) in {}",
        if all { count } else { 1 },
        rel
    ))
}

/// Ask the model for the literal `{find, replace}` pair described by the specs
async fn materialize_find_replace(
    args: &Args,
    step: &Step,
    rel: &str,
    content: &str,
    ctx: &ToolContext<'_>,
) -> Result<(String, String)> {
    let find_spec = str_arg(args, &["find_spec"]).unwrap_or(&step.action);
    let replace_spec = str_arg(args, &["replace_spec"]).unwrap_or("");
    let prompt = format!(
        "File `{}`:\n```\n{}\n```\n\nText to find: {}\nReplace it with: {}\n\n\
         Respond with ONLY a JSON object {{\"find\": \"<exact text from the file>\", \"replace\": \"<new text>\"}}.",
        rel,
        truncate_chars(content, MAX_CONTEXT_CHARS),
        find_spec,
        replace_spec
    );
    let reply = generate(ctx, prompt).await?;
    let value: Value = serde_json::from_str(&clean_json(&reply))
        .context("Model did not return a find/replace object")?;
    let find = value
        .get("find")
        .and_then(Value::as_str)
        .filter(|f| !f.is_empty())
        .context("Model did not return text to find")?;
    let replace = value.get("replace").and_then(Value::as_str).unwrap_or("");
    Ok((find.to_string(), replace.to_string()))
}

pub async fn update_json(
    args: &Args,
    _step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
) -> Result<String> {
    let path = resolve_path(ctx.root(), require_str(args, &["path", "file"])?);
    let rel = display_path(ctx.root(), &path);
    let key_path = require_str(args, &["json_path", "key", "key_path"])?;

    let value: Value = match args.get("value") {
        Some(value) => value.clone(),
        None => match str_arg(args, &["value_spec"]) {
            Some(spec) => {
                let prompt = format!(
                    "Produce the JSON value for `{}` in `{}`: {}\n\nRespond with ONLY the JSON value.",
                    key_path, rel, spec
                );
                let reply = generate(ctx, prompt).await?;
                serde_json::from_str(strip_code_fences(&reply).trim())
                    .context("Model did not return a JSON value")?
            }
            None => bail!("Missing 'value' argument"),
        },
    };

    let mut doc: Value = if path.is_file() {
        let raw = fs::read_to_string(&path).await?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", rel))?
    } else {
        Value::Object(Map::new())
    };
    set_json_path(&mut doc, key_path, value)?;

    write_file(&path, &format!("{}\n", serde_json::to_string_pretty(&doc)?)).await?;
    session.touch(&path);
    Ok(format!("Set {} in {}", key_path, rel))
}

/// Set `value` at a dotted path, creating objects along the way. Numeric
/// segments index arrays; an index equal to the length appends.
pub fn set_json_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let keys: Vec<&str> = path.split('.').map(str::trim).filter(|k| !k.is_empty()).collect();
    let Some((last, parents)) = keys.split_last() else {
        bail!("Empty JSON path");
    };

    let mut current = doc;
    for key in parents {
        current = child_mut(current, key)?;
    }
    let slot = child_mut(current, last)?;
    *slot = value;
    Ok(())
}

fn child_mut<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Value> {
    if !value.is_object() && !value.is_array() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Array(items) => {
            let idx: usize = key
                .parse()
                .with_context(|| format!("Expected an array index, found '{}'", key))?;
            if idx > items.len() {
                bail!("Array index {} out of range (length {})", idx, items.len());
            }
            if idx == items.len() {
                items.push(Value::Object(Map::new()));
            }
            Ok(&mut items[idx])
        }
        Value::Object(map) => Ok(map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        _ => bail!("Cannot descend into '{}'", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_set_json_path() {
        let mut doc = json!({"name": "app", "scripts": {"test": "jest"}, "files": ["a"]});
        set_json_path(&mut doc, "scripts.build", json!("tsc")).unwrap();
        set_json_path(&mut doc, "engines.node", json!(">=18")).unwrap();
        set_json_path(&mut doc, "files.1", json!("b")).unwrap();
        set_json_path(&mut doc, "name", json!("renamed")).unwrap();
        assert_eq!(
            doc,
            json!({
                "name": "renamed",
                "scripts": {"test": "jest", "build": "tsc"},
                "files": ["a", "b"],
                "engines": {"node": ">=18"}
            })
        );
        assert!(set_json_path(&mut doc, "files.5", json!(1)).is_err());
        assert!(set_json_path(&mut doc, "files.x", json!(1)).is_err());
        assert!(set_json_path(&mut doc, "", json!(1)).is_err());
    }

    #[test]
    fn test_clean_replacement() {
        assert_eq!(clean_replacement("```ts\nconst a = 1;\n```"), "const a = 1;");
        assert_eq!(clean_replacement("x\n"), "x");
        assert_eq!(clean_replacement("x\n\n"), "x\n");
        assert_eq!(append_text("a", "b\n\n"), "a\nb\n");
        assert_eq!(append_text("", "b"), "b\n");
    }
}
