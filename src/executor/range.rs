//! Target range resolution for `edit_file`.
//!
//! First match wins: explicit line args (a start past the last line means an
//! append), a saved location on the same file,
//! a retrieved chunk of the same file, the editor selection on that file, and
//! finally the whole file. The whole-file case becomes an append when the file
//! already has content and the instruction does not ask to replace it.

use super::session::SavedLocation;
use super::tools::usize_arg;
use crate::host::EditorFocus;
use crate::planner::plan::Args;
use crate::retrieval::ScoredChunk;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOrigin {
    ExplicitArgs,
    SavedLocation,
    RetrievedChunk,
    FocusSelection,
    WholeFile,
    Append,
}

/// Byte range `start..end` of the file content to replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditRange {
    pub start: usize,
    pub end: usize,
    pub origin: RangeOrigin,
}

impl EditRange {
    pub fn lines(&self, content: &str) -> (usize, usize) {
        let start = content[..self.start].matches('\n').count() + 1;
        let end = content[..self.end].matches('\n').count() + 1;
        (start, end)
    }
}

pub struct RangeInputs<'a> {
    /// Absolute path of the file being edited
    pub path: &'a Path,
    pub content: &'a str,
    pub args: &'a Args,
    pub instruction: &'a str,
    pub saved: &'a [SavedLocation],
    pub retrieved: &'a [ScoredChunk],
    pub focus: Option<&'a EditorFocus>,
}

pub fn resolve_edit_range(inputs: &RangeInputs<'_>) -> EditRange {
    let content = inputs.content;
    let with = |(start, end): (usize, usize), origin| EditRange { start, end, origin };

    if let Some((start, end)) = explicit_lines(inputs.args) {
        if let Some(span) = line_span(content, start, end) {
            return with(span, RangeOrigin::ExplicitArgs);
        }
        let line_count = content.lines().count();
        if start > line_count {
            tracing::warn!(
                "Lines {}-{} are past the end of {} ({} lines), appending instead",
                start,
                end,
                inputs.path.display(),
                line_count
            );
            return with((content.len(), content.len()), RangeOrigin::Append);
        }
        tracing::warn!("Ignoring invalid line range {}-{} for {}", start, end, inputs.path.display());
    }

    let on_file = |path: &str| Path::new(path) == inputs.path;

    let named = inputs
        .args
        .get("location")
        .and_then(Value::as_str)
        .and_then(|name| inputs.saved.iter().find(|l| l.name == name))
        .filter(|l| on_file(&l.path));
    let saved = named.or_else(|| inputs.saved.iter().rev().find(|l| on_file(&l.path)));
    if let Some(span) = saved.and_then(|l| line_span(content, l.start_line, l.end_line)) {
        return with(span, RangeOrigin::SavedLocation);
    }

    let chunk = inputs
        .retrieved
        .iter()
        .find(|c| on_file(&c.chunk.file_path));
    if let Some(span) = chunk.and_then(|c| line_span(content, c.chunk.start_line, c.chunk.end_line)) {
        return with(span, RangeOrigin::RetrievedChunk);
    }

    if let Some(focus) = inputs.focus.filter(|f| on_file(&f.path)) {
        if let (Some(start), Some(end)) = (focus.start_line, focus.end_line) {
            if let Some(span) = line_span(content, start, end) {
                return with(span, RangeOrigin::FocusSelection);
            }
        }
    }

    if !content.trim().is_empty() && !asks_for_replacement(inputs.instruction) {
        return with((content.len(), content.len()), RangeOrigin::Append);
    }
    with((0, content.len()), RangeOrigin::WholeFile)
}

/// 1-based inclusive line bounds from `start`/`end`, `start_line`/`end_line`
/// or `range: {start, end}`
pub fn explicit_lines(args: &Args) -> Option<(usize, usize)> {
    let flat = usize_arg(args, &["start_line", "start"]).map(|start| {
        let end = usize_arg(args, &["end_line", "end"]).unwrap_or(start);
        (start, end)
    });
    flat.or_else(|| {
        let range = args.get("range")?.as_object()?;
        let start = usize_arg(range, &["start", "start_line"])?;
        let end = usize_arg(range, &["end", "end_line"]).unwrap_or(start);
        Some((start, end))
    })
}

/// Byte span of lines `start..=end` (1-based): from the first byte of the
/// start line to the end of the end line, excluding its line terminator.
/// `end` is clamped to the last line; `None` when `start` is out of range.
pub fn line_span(content: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    if start == 0 || end < start {
        return None;
    }
    let mut line_starts = vec![0];
    line_starts.extend(content.match_indices('\n').map(|(i, _)| i + 1));
    // A trailing newline does not open another line
    if content.ends_with('\n') {
        line_starts.pop();
    }
    let line_count = if content.is_empty() { 0 } else { line_starts.len() };
    if start > line_count {
        return None;
    }
    let end = end.min(line_count);

    let from = line_starts[start - 1];
    let mut to = match line_starts.get(end) {
        Some(next) => next - 1,
        None => content.strip_suffix('\n').map_or(content.len(), str::len),
    };
    if content[..to].ends_with('\r') {
        to -= 1;
    }
    Some((from, to.max(from)))
}

fn asks_for_replacement(instruction: &str) -> bool {
    let text = instruction.to_lowercase();
    if text.contains("overwrite") || text.contains("from scratch") {
        return true;
    }
    let verb = text.contains("replace") || text.contains("rewrite");
    let scope = ["whole", "entire", "all of", "file", "contents"]
        .iter()
        .any(|w| text.contains(w));
    verb && scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Chunk, ContentType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const FILE: &str = "/w/src/app.ts";

    fn content() -> String {
        (1..=15).map(|i| format!("line {}\n", i)).collect()
    }

    fn chunk(path: &str, start: usize, end: usize) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: "c".to_string(),
                source_tag: "ts-ast".to_string(),
                file_path: path.to_string(),
                language: "typescript".to_string(),
                content_type: ContentType::Function,
                name: "f".to_string(),
                start_line: start,
                end_line: end,
                dependencies: Vec::new(),
                content: String::new(),
                summary: None,
                embedding: None,
            },
            score: 0.9,
        }
    }

    fn saved(name: &str, path: &str, start: usize, end: usize) -> SavedLocation {
        SavedLocation {
            name: name.to_string(),
            path: path.to_string(),
            start_line: start,
            end_line: end,
            start_offset: 0,
            end_offset: 0,
        }
    }

    fn resolve(
        args: serde_json::Value,
        saved: &[SavedLocation],
        retrieved: &[ScoredChunk],
        focus: Option<&EditorFocus>,
        instruction: &str,
    ) -> (EditRange, String) {
        let text = content();
        let args = args.as_object().cloned().unwrap_or_default();
        let range = resolve_edit_range(&RangeInputs {
            path: Path::new(FILE),
            content: &text,
            args: &args,
            instruction,
            saved,
            retrieved,
            focus,
        });
        let slice = text[range.start..range.end].to_string();
        (range, slice)
    }

    #[test]
    fn test_line_span_excludes_terminator() {
        let text = "a\nbb\nccc\n";
        assert_eq!(line_span(text, 2, 2), Some((2, 4)));
        assert_eq!(line_span(text, 1, 3), Some((0, 8)));
        assert_eq!(line_span(text, 3, 99), Some((5, 8)));
        assert_eq!(line_span(text, 4, 4), None);
        assert_eq!(line_span("x\r\ny\r\n", 1, 1), Some((0, 1)));
        assert_eq!(line_span("no newline", 1, 1), Some((0, 10)));
        assert_eq!(line_span("", 1, 1), None);
    }

    #[test]
    fn test_explicit_lines_past_eof_append() {
        let locations = [saved("handler", FILE, 3, 4)];
        let retrieved = [chunk(FILE, 10, 12)];
        let (range, slice) = resolve(
            json!({"start_line": 20, "end_line": 25}),
            &locations,
            &retrieved,
            None,
            "Replace the whole file",
        );
        assert_eq!(range.origin, RangeOrigin::Append);
        assert_eq!(range.start, content().len());
        assert_eq!(slice, "");

        let (range, _) = resolve(json!({"start": 14, "end": 40}), &[], &[], None, "x");
        assert_eq!(range.origin, RangeOrigin::ExplicitArgs);
    }

    #[test]
    fn test_retrieved_chunk_span_covers_lines_10_to_12() {
        let retrieved = [chunk("/w/src/other.ts", 1, 2), chunk(FILE, 10, 12)];
        let (range, slice) = resolve(json!({}), &[], &retrieved, None, "fix the bug");
        assert_eq!(range.origin, RangeOrigin::RetrievedChunk);
        assert_eq!(slice, "line 10\nline 11\nline 12");

        let text = content();
        let edited = format!("{}NEW{}", &text[..range.start], &text[range.end..]);
        let before: Vec<&str> = text.lines().collect();
        let after: Vec<&str> = edited.lines().collect();
        assert_eq!(&after[..9], &before[..9]);
        assert_eq!(after[9], "NEW");
        assert_eq!(&after[10..], &before[12..]);
    }

    #[test]
    fn test_priority_order() {
        let locations = [saved("handler", FILE, 3, 4)];
        let retrieved = [chunk(FILE, 10, 12)];
        let focus = EditorFocus {
            path: FILE.to_string(),
            start_line: Some(14),
            end_line: Some(15),
        };

        let (range, slice) = resolve(
            json!({"start_line": 1, "end_line": 2}),
            &locations,
            &retrieved,
            Some(&focus),
            "",
        );
        assert_eq!(range.origin, RangeOrigin::ExplicitArgs);
        assert_eq!(slice, "line 1\nline 2");

        let (range, slice) = resolve(json!({}), &locations, &retrieved, Some(&focus), "");
        assert_eq!(range.origin, RangeOrigin::SavedLocation);
        assert_eq!(slice, "line 3\nline 4");

        let (range, slice) = resolve(json!({}), &[], &[], Some(&focus), "");
        assert_eq!(range.origin, RangeOrigin::FocusSelection);
        assert_eq!(slice, "line 14\nline 15");
    }

    #[test]
    fn test_named_location_beats_latest_on_same_file() {
        let locations = [
            saved("first", FILE, 1, 1),
            saved("second", FILE, 5, 6),
            saved("elsewhere", "/w/src/b.ts", 2, 2),
        ];
        let (_, slice) = resolve(json!({"location": "first"}), &locations, &[], None, "");
        assert_eq!(slice, "line 1");
        let (_, slice) = resolve(json!({"location": "elsewhere"}), &locations, &[], None, "");
        assert_eq!(slice, "line 5\nline 6");
    }

    #[test]
    fn test_range_object_and_string_numbers() {
        let (_, slice) = resolve(json!({"range": {"start": "7", "end": 8}}), &[], &[], None, "");
        assert_eq!(slice, "line 7\nline 8");
        let (range, _) = resolve(json!({"start": 40}), &[], &[], None, "");
        assert_eq!(range.origin, RangeOrigin::Append);
    }

    #[test]
    fn test_whole_file_only_when_replacement_requested() {
        let (range, _) = resolve(json!({}), &[], &[], None, "add a logout handler");
        assert_eq!(range.origin, RangeOrigin::Append);
        assert_eq!(range.start, content().len());

        let (range, slice) = resolve(json!({}), &[], &[], None, "Rewrite the entire file in TypeScript");
        assert_eq!(range.origin, RangeOrigin::WholeFile);
        assert_eq!(slice, content());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let locations = [saved("a", FILE, 2, 3), saved("b", FILE, 6, 9)];
        let retrieved = [chunk(FILE, 10, 12)];
        let first = resolve(json!({"location": "a"}), &locations, &retrieved, None, "edit");
        for _ in 0..5 {
            assert_eq!(
                resolve(json!({"location": "a"}), &locations, &retrieved, None, "edit"),
                first
            );
        }
    }
}
