//! Builtin tool handlers. Every handler returns a descriptive string; failures
//! surface as errors and are turned into `Error: …` results by the dispatcher.

use super::edit;
use super::{bool_arg, display_path, require_str, resolve_path, str_arg, usize_arg, ToolContext};
use crate::executor::range::line_span;
use crate::executor::session::{SavedLocation, Session};
use crate::indexer::{collect_files, read_text};
use crate::parser::brace::match_block;
use crate::parser::{slice_lines, truncate_chars, ContentType};
use crate::planner::plan::{Args, Step};
use crate::retrieval::ScoredChunk;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use walkdir::WalkDir;

const MAX_OUTPUT_CHARS: usize = 8_000;
const MAX_READ_CHARS: usize = 20_000;
const DEFAULT_MAX_RESULTS: usize = 50;

/// Shell metacharacters that could chain a second command past the allowlist
const SHELL_CHAINING: &[&str] = &[";", "&&", "||", "|", "`", "$(", ">", "<", "\n"];

pub async fn run(
    name: &str,
    args: &Args,
    step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
) -> Result<String> {
    match name {
        "check_exists" => check_exists(args, ctx),
        "search_code" => search_code(args, step, ctx, session, false).await,
        "retrieve_chunks" => search_code(args, step, ctx, session, true).await,
        "locate_code" => locate_code(args, ctx, session).await,
        "create_file" => edit::create_file(args, step, ctx, session).await,
        "edit_file" => edit::edit_file(args, step, ctx, session).await,
        "append_file" => edit::append_file(args, step, ctx, session).await,
        "replace_in_file" => edit::replace_in_file(args, step, ctx, session).await,
        "update_json" => edit::update_json(args, step, ctx, session).await,
        "read_file" => read_file(args, ctx, session).await,
        "list_directory" => list_directory(args, ctx).await,
        "delete_path" => delete_path(args, ctx, session).await,
        "move_path" => move_path(args, ctx, session).await,
        "copy_path" => copy_path(args, ctx, session).await,
        "create_directory" => create_directory(args, ctx).await,
        "search_text" => search_text(args, ctx, false).await,
        "search_regex" => search_text(args, ctx, true).await,
        "run_command" => run_command(args, ctx).await,
        "format_file" => format_file(args, ctx, session).await,
        "focus_editor" => focus_editor(args, ctx, session),
        other => bail!("Unknown tool: {}", other),
    }
}

fn check_exists(args: &Args, ctx: &ToolContext<'_>) -> Result<String> {
    let raw = require_str(args, &["path", "file"])?;
    let path = resolve_path(ctx.root(), raw);
    let key = path.to_string_lossy();
    match ctx.planner_index.get(&*key) {
        Some(summary) => Ok(format!("Exists: {}\nSummary: {}", raw, summary)),
        None if path.exists() => Ok(format!("Exists: {} (not in the architecture index)", raw)),
        None => Ok(format!("Not found: {}", raw)),
    }
}

async fn search_code(
    args: &Args,
    step: &Step,
    ctx: &ToolContext<'_>,
    session: &mut Session,
    with_content: bool,
) -> Result<String> {
    let query = str_arg(args, &["query", "q"])
        .map(str::to_string)
        .unwrap_or_else(|| step.action.clone());
    let k = usize_arg(args, &["k", "limit", "top_k"])
        .unwrap_or(ctx.config.retrieval_top_k)
        .max(1);

    let results = ctx.retrieval.retrieve(&query, k).await;
    ctx.sink.post_message(
        "chunks",
        json!(results
            .iter()
            .map(|r| json!({
                "path": r.chunk.file_path,
                "name": r.chunk.name,
                "startLine": r.chunk.start_line,
                "endLine": r.chunk.end_line,
                "score": r.score,
            }))
            .collect::<Vec<_>>()),
    );

    if results.is_empty() {
        return Ok(format!("No results found for: {}", query));
    }
    let text = format_results(ctx.root(), &results, with_content);
    session.retrieved = results;
    Ok(text)
}

pub fn format_results(root: &Path, results: &[ScoredChunk], with_content: bool) -> String {
    let mut formatted = String::from("Search results:\n\n");
    for (i, result) in results.iter().enumerate() {
        let chunk = &result.chunk;
        formatted.push_str(&format!(
            "{}. **{}** {} (`{}:{}-{}`)\nScore: {:.2}%\n",
            i + 1,
            chunk.name,
            chunk.content_type.as_str(),
            display_path(root, Path::new(&chunk.file_path)),
            chunk.start_line,
            chunk.end_line,
            result.score * 100.0,
        ));
        if let Some(summary) = &chunk.summary {
            formatted.push_str(&format!("{}\n", summary));
        }
        if with_content {
            formatted.push_str(&format!("```\n{}\n```\n", truncate_chars(&chunk.content, 2000)));
        }
        formatted.push('\n');
    }
    formatted
}

async fn locate_code(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let name = str_arg(args, &["name", "symbol"]);
    let pattern = str_arg(args, &["pattern", "query"]);
    if name.is_none() && pattern.is_none() {
        bail!("Missing 'name' or 'pattern' argument");
    }
    let scope = str_arg(args, &["path", "file"]).map(|p| resolve_path(ctx.root(), p));

    // Indexed declarations first
    let mut found: Option<(PathBuf, usize, usize)> = None;
    if let Some(name) = name {
        let chunks = ctx.store.chunks().await;
        found = chunks
            .iter()
            .filter(|c| c.name == name && c.content_type != ContentType::Import)
            .find(|c| scope.as_ref().map_or(true, |s| Path::new(&c.file_path) == s.as_path()))
            .map(|c| (PathBuf::from(&c.file_path), c.start_line, c.end_line));
    }

    if found.is_none() {
        let matcher = match pattern {
            Some(p) => Regex::new(p).or_else(|_| Regex::new(&regex::escape(p)))?,
            None => Regex::new(&format!(r"\b{}\b", regex::escape(name.unwrap_or_default())))?,
        };
        let files = match &scope {
            Some(path) if path.is_file() => vec![path.clone()],
            Some(dir) => collect_files(dir, &[], &[])?,
            None => collect_files(ctx.root(), &ctx.config.include_globs, &ctx.config.exclude_globs)?,
        };
        for file in files {
            let Some(content) = read_text(&file).await else {
                continue;
            };
            if let Some((start, end)) = find_block(&content, &matcher) {
                found = Some((file, start, end));
                break;
            }
        }
    }

    let Some((path, start_line, end_line)) = found else {
        bail!("No match for {}", name.or(pattern).unwrap_or_default());
    };
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let (start_offset, end_offset) =
        line_span(&content, start_line, end_line).context("Located range is outside the file")?;

    let label = str_arg(args, &["save_as", "location"])
        .or(name)
        .or(pattern)
        .unwrap_or("located")
        .to_string();
    let rel = display_path(ctx.root(), &path);
    let snippet = truncate_chars(&content[start_offset..end_offset], 1500).to_string();
    session.save_location(SavedLocation {
        name: label.clone(),
        path: path.to_string_lossy().to_string(),
        start_line,
        end_line,
        start_offset,
        end_offset,
    });
    Ok(format!(
        "Located {} in {} lines {}-{} (saved as '{}')\n```\n{}\n```",
        name.or(pattern).unwrap_or_default(),
        rel,
        start_line,
        end_line,
        label,
        snippet
    ))
}

/// 1-based line span of the first matching line's enclosing block: braces
/// when the language has them, otherwise the indented body below the header
pub fn find_block(content: &str, matcher: &Regex) -> Option<(usize, usize)> {
    let lines: Vec<&str> = content.lines().collect();
    let idx = lines.iter().position(|l| matcher.is_match(l))?;
    if let Some(end) = match_block(&lines, idx) {
        return Some((idx + 1, end + 1));
    }

    let indent = |l: &str| l.len() - l.trim_start().len();
    let header = indent(lines[idx]);
    let mut end = idx;
    for (i, line) in lines.iter().enumerate().skip(idx + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent(line) <= header {
            break;
        }
        end = i;
    }
    Some((idx + 1, end + 1))
}

async fn read_file(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let raw = require_str(args, &["path", "file"])?;
    let path = resolve_path(ctx.root(), raw);
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("File not found or unreadable: {}", raw))?;

    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let start = usize_arg(args, &["start_line", "start"]).unwrap_or(1).max(1);
    let end = usize_arg(args, &["end_line", "end"]).unwrap_or(total).min(total);
    if total > 0 && start > end {
        bail!("Invalid line range {}-{} for {} ({} lines)", start, end, raw, total);
    }
    let text = slice_lines(&lines, start, end);

    if let Some((start_offset, end_offset)) = line_span(&content, start, end) {
        let name = str_arg(args, &["save_as"])
            .map(str::to_string)
            .unwrap_or_else(|| display_path(ctx.root(), &path));
        session.save_location(SavedLocation {
            name,
            path: path.to_string_lossy().to_string(),
            start_line: start,
            end_line: end,
            start_offset,
            end_offset,
        });
    }

    Ok(format!(
        "File: {} (lines {}-{} of {})\n{}",
        raw,
        start.min(total),
        end,
        total,
        truncate_chars(&text, MAX_READ_CHARS)
    ))
}

async fn list_directory(args: &Args, ctx: &ToolContext<'_>) -> Result<String> {
    let raw = str_arg(args, &["path", "dir"]).unwrap_or(".");
    let path = resolve_path(ctx.root(), raw);
    let mut entries = fs::read_dir(&path)
        .await
        .with_context(|| format!("Directory not found: {}", raw))?;

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await.map_or(false, |t| t.is_dir()) {
            dirs.push(format!("{}/", name));
        } else {
            files.push(name);
        }
    }
    dirs.sort();
    files.sort();

    if dirs.is_empty() && files.is_empty() {
        return Ok(format!("{} is empty", raw));
    }
    Ok(format!("Contents of {}:\n{}", raw, [dirs, files].concat().join("\n")))
}

/// Files under `path` (or `path` itself), for re-index bookkeeping
fn files_under(path: &Path) -> Vec<PathBuf> {
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

async fn delete_path(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let raw = require_str(args, &["path", "file"])?;
    let path = resolve_path(ctx.root(), raw);
    if path == ctx.root() {
        bail!("Refusing to delete the workspace root");
    }
    let meta = fs::metadata(&path)
        .await
        .with_context(|| format!("Path not found: {}", raw))?;

    for file in files_under(&path) {
        session.touch(&file);
    }
    if meta.is_dir() {
        fs::remove_dir_all(&path).await?;
    } else {
        fs::remove_file(&path).await?;
    }
    session.touch(&path);
    Ok(format!("Deleted {}", raw))
}

fn from_to<'a>(args: &'a Args) -> Result<(&'a str, &'a str)> {
    let from = require_str(args, &["from", "source", "src", "path"])?;
    let to = require_str(args, &["to", "destination", "dest", "target"])?;
    Ok((from, to))
}

async fn move_path(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let (from_raw, to_raw) = from_to(args)?;
    let from = resolve_path(ctx.root(), from_raw);
    let to = resolve_path(ctx.root(), to_raw);
    if !from.exists() {
        bail!("Path not found: {}", from_raw);
    }
    if to.exists() {
        bail!("Destination already exists: {}", to_raw);
    }

    let moved = files_under(&from);
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(&from, &to)
        .await
        .with_context(|| format!("Failed to move {} to {}", from_raw, to_raw))?;

    for old in moved {
        if let Ok(rel) = old.strip_prefix(&from) {
            let new = if rel.as_os_str().is_empty() { to.clone() } else { to.join(rel) };
            session.touch(&new);
        }
        session.touch(&old);
    }
    Ok(format!("Moved {} to {}", from_raw, to_raw))
}

async fn copy_path(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let (from_raw, to_raw) = from_to(args)?;
    let from = resolve_path(ctx.root(), from_raw);
    let to = resolve_path(ctx.root(), to_raw);
    if !from.exists() {
        bail!("Path not found: {}", from_raw);
    }

    let mut copied = 0;
    if from.is_dir() {
        for entry in WalkDir::new(&from).into_iter().flatten() {
            let rel = entry.path().strip_prefix(&from)?;
            let target = to.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).await?;
            } else if entry.file_type().is_file() {
                fs::copy(entry.path(), &target).await?;
                session.touch(&target);
                copied += 1;
            }
        }
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&from, &to).await?;
        session.touch(&to);
        copied = 1;
    }
    Ok(format!("Copied {} to {} ({} files)", from_raw, to_raw, copied))
}

async fn create_directory(args: &Args, ctx: &ToolContext<'_>) -> Result<String> {
    let raw = require_str(args, &["path", "dir"])?;
    fs::create_dir_all(resolve_path(ctx.root(), raw)).await?;
    Ok(format!("Created directory {}", raw))
}

async fn search_text(args: &Args, ctx: &ToolContext<'_>, use_regex: bool) -> Result<String> {
    let needle = if use_regex {
        require_str(args, &["pattern", "regex", "query"])?
    } else {
        require_str(args, &["query", "text", "pattern"])?
    };
    let max = usize_arg(args, &["max_results", "limit"]).unwrap_or(DEFAULT_MAX_RESULTS);
    let case_sensitive = bool_arg(args, "case_sensitive").unwrap_or(false);

    let matcher = if use_regex {
        Regex::new(needle).with_context(|| format!("Invalid regex: {}", needle))?
    } else {
        let escaped = regex::escape(needle);
        let pattern = if case_sensitive { escaped } else { format!("(?i){}", escaped) };
        Regex::new(&pattern)?
    };

    let files = match str_arg(args, &["path", "dir"]).map(|p| resolve_path(ctx.root(), p)) {
        Some(path) if path.is_file() => vec![path],
        Some(dir) => collect_files(&dir, &[], &[])?,
        None => collect_files(ctx.root(), &ctx.config.include_globs, &ctx.config.exclude_globs)?,
    };

    let mut hits = Vec::new();
    'files: for file in &files {
        let Some(content) = read_text(file).await else {
            continue;
        };
        for (i, line) in content.lines().enumerate() {
            if matcher.is_match(line) {
                hits.push(format!(
                    "{}:{}: {}",
                    display_path(ctx.root(), file),
                    i + 1,
                    truncate_chars(line.trim(), 200)
                ));
                if hits.len() >= max {
                    break 'files;
                }
            }
        }
    }

    if hits.is_empty() {
        return Ok(format!("No matches for: {}", needle));
    }
    Ok(format!("{} matches for {}:\n{}", hits.len(), needle, hits.join("\n")))
}

/// Whether `command` starts with an allowed prefix and chains nothing else
pub fn command_allowed(command: &str, allowlist: &[String]) -> bool {
    let command = command.trim();
    if SHELL_CHAINING.iter().any(|c| command.contains(c)) {
        return false;
    }
    allowlist.iter().any(|prefix| {
        command == prefix.as_str()
            || command
                .strip_prefix(prefix.as_str())
                .map_or(false, |rest| rest.starts_with(' '))
    })
}

async fn run_command(args: &Args, ctx: &ToolContext<'_>) -> Result<String> {
    let command = require_str(args, &["command", "cmd"])?;
    if !command_allowed(command, &ctx.config.command_allowlist) {
        bail!(
            "Command not allowed: {} (allowed prefixes: {})",
            command,
            ctx.config.command_allowlist.join(", ")
        );
    }
    let timeout = usize_arg(args, &["timeout_secs", "timeout"])
        .map(|s| Duration::from_secs(s as u64))
        .unwrap_or(ctx.config.command_timeout);
    shell(command, ctx.root(), timeout).await
}

async fn shell(command: &str, cwd: &Path, timeout: Duration) -> Result<String> {
    tracing::info!("Running `{}` in {}", command, cwd.display());
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn: {}", command))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => bail!("Command timed out after {}s: {}", timeout.as_secs(), command),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut result = format!("Exit code: {}\n", output.status.code().unwrap_or(-1));
    if !stdout.trim().is_empty() {
        result.push_str(&format!("stdout:\n{}\n", truncate_chars(stdout.trim_end(), MAX_OUTPUT_CHARS)));
    }
    if !stderr.trim().is_empty() {
        result.push_str(&format!("stderr:\n{}\n", truncate_chars(stderr.trim_end(), MAX_OUTPUT_CHARS)));
    }
    Ok(result)
}

async fn format_file(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let raw = require_str(args, &["path", "file"])?;
    let path = resolve_path(ctx.root(), raw);
    if !path.is_file() {
        bail!("File not found: {}", raw);
    }
    let quoted = format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"));
    let command = format!("{} {}", ctx.config.formatter_command, quoted);
    let output = shell(&command, ctx.root(), ctx.config.command_timeout).await?;
    session.touch(&path);
    Ok(format!("Formatted {}\n{}", raw, output))
}

fn focus_editor(args: &Args, ctx: &ToolContext<'_>, session: &mut Session) -> Result<String> {
    let raw = require_str(args, &["path", "file"])?;
    let focus = crate::host::EditorFocus {
        path: resolve_path(ctx.root(), raw).to_string_lossy().to_string(),
        start_line: usize_arg(args, &["start_line", "start"]),
        end_line: usize_arg(args, &["end_line", "end"]),
    };
    ctx.sink.post_message("focus", json!(focus));
    session.focus = Some(focus);
    Ok(format!("Focused {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_allowlist() {
        let allow = vec!["npm test".to_string(), "ls".to_string(), "cargo".to_string()];
        assert!(command_allowed("npm test", &allow));
        assert!(command_allowed("  ls -la src", &allow));
        assert!(command_allowed("cargo fmt --all", &allow));
        assert!(!command_allowed("lsof", &allow));
        assert!(!command_allowed("rm -rf /", &allow));
        assert!(!command_allowed("ls; rm -rf /", &allow));
        assert!(!command_allowed("cargo build && curl evil", &allow));
        assert!(!command_allowed("ls $(whoami)", &allow));
    }

    #[test]
    fn test_find_block_braces_and_indent() {
        let ts = "import x from 'y';\n\nfunction handle(req) {\n  if (req) {\n    return 1;\n  }\n}\n\nconst after = 2;\n";
        let re = Regex::new(r"\bhandle\b").unwrap();
        assert_eq!(find_block(ts, &re), Some((3, 7)));

        let py = "def first():\n    a = 1\n\n    return a\n\ndef second():\n    pass\n";
        let re = Regex::new(r"\bfirst\b").unwrap();
        assert_eq!(find_block(py, &re), Some((1, 4)));

        assert_eq!(find_block(py, &Regex::new("missing").unwrap()), None);
    }
}
