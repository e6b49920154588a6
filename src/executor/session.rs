//! Per-conversation state shared by the planner and executor calls.

use crate::host::EditorFocus;
use crate::planner::plan::Plan;
use crate::retrieval::ScoredChunk;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

/// Tool-output summaries kept for tool selection context
pub const TOOL_OUTPUT_CAPACITY: usize = 5;

/// Memory entries handed to the planner
const MEMORY_WINDOW: usize = 10;

/// Named range of a file, recorded by `locate_code` and `read_file`.
/// Lines are 1-based inclusive; offsets are byte offsets at save time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedLocation {
    pub name: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// 1-based step number at execution time
    pub step: usize,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub elapsed_ms: u64,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct Session {
    pub id: String,
    pub plan: Plan,
    /// 0-based indices of steps executed at least once
    pub executed: BTreeSet<usize>,
    pub records: Vec<ExecutionRecord>,
    pub saved_locations: Vec<SavedLocation>,
    pub retrieved: Vec<ScoredChunk>,
    pub tool_outputs: VecDeque<String>,
    pub memory: Vec<String>,
    pub focus: Option<EditorFocus>,
    /// Absolute paths written, moved or deleted since the last re-index
    pub touched_files: BTreeSet<String>,
    /// Every path touched since the current plan was installed
    pub files_changed: BTreeSet<String>,
    pub summarized: bool,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Install a new plan, replacing the previous one
    pub fn install_plan(&mut self, plan: Plan) {
        self.plan = plan;
        self.executed.clear();
        self.records.clear();
        self.files_changed.clear();
        self.summarized = false;
    }

    pub fn is_complete(&self) -> bool {
        !self.plan.is_empty() && (0..self.plan.len()).all(|i| self.executed.contains(&i))
    }

    /// Indices of steps not yet executed, in order
    pub fn pending(&self) -> Vec<usize> {
        (0..self.plan.len())
            .filter(|i| !self.executed.contains(i))
            .collect()
    }

    /// Save a location; an existing entry with the same name is replaced in place
    pub fn save_location(&mut self, location: SavedLocation) {
        match self
            .saved_locations
            .iter_mut()
            .find(|l| l.name == location.name)
        {
            Some(existing) => *existing = location,
            None => self.saved_locations.push(location),
        }
    }

    pub fn record_output(&mut self, summary: String) {
        if self.tool_outputs.len() == TOOL_OUTPUT_CAPACITY {
            self.tool_outputs.pop_front();
        }
        self.tool_outputs.push_back(summary);
    }

    pub fn touch(&mut self, path: &Path) {
        let path = path.to_string_lossy().to_string();
        self.files_changed.insert(path.clone());
        self.touched_files.insert(path);
    }

    pub fn take_touched(&mut self) -> Vec<String> {
        std::mem::take(&mut self.touched_files).into_iter().collect()
    }

    /// Most recent memory entries, oldest first
    pub fn memory_text(&self) -> String {
        let skip = self.memory.len().saturating_sub(MEMORY_WINDOW);
        self.memory[skip..].join("\n")
    }

    pub fn clear(&mut self) {
        let id = std::mem::take(&mut self.id);
        *self = Self::new(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan::Step;

    fn location(name: &str, path: &str, start: usize) -> SavedLocation {
        SavedLocation {
            name: name.to_string(),
            path: path.to_string(),
            start_line: start,
            end_line: start + 1,
            start_offset: 0,
            end_offset: 0,
        }
    }

    #[test]
    fn test_ring_buffer_keeps_latest_outputs() {
        let mut session = Session::new("s");
        for i in 0..8 {
            session.record_output(format!("out {}", i));
        }
        assert_eq!(session.tool_outputs.len(), TOOL_OUTPUT_CAPACITY);
        assert_eq!(session.tool_outputs.front().map(String::as_str), Some("out 3"));
        assert_eq!(session.tool_outputs.back().map(String::as_str), Some("out 7"));
    }

    #[test]
    fn test_saved_location_name_is_replaced_in_place() {
        let mut session = Session::new("s");
        session.save_location(location("a", "/w/x.ts", 1));
        session.save_location(location("b", "/w/y.ts", 5));
        session.save_location(location("a", "/w/x.ts", 9));
        assert_eq!(session.saved_locations.len(), 2);
        assert_eq!(session.saved_locations[0].start_line, 9);
        assert_eq!(session.saved_locations[1].path, "/w/y.ts");
    }

    #[test]
    fn test_install_plan_resets_progress() {
        let mut session = Session::new("s");
        session.install_plan(Plan {
            steps: vec![Step::new("a", "b")],
        });
        session.executed.insert(0);
        session.summarized = true;
        assert!(session.is_complete());

        session.install_plan(Plan {
            steps: vec![Step::new("c", "d"), Step::new("e", "f")],
        });
        assert!(session.executed.is_empty());
        assert!(!session.summarized);
        assert_eq!(session.pending(), vec![0, 1]);
    }

    #[test]
    fn test_clear_keeps_id() {
        let mut session = Session::new("chat-1");
        session.memory.push("note".to_string());
        session.clear();
        assert_eq!(session.id, "chat-1");
        assert!(session.memory.is_empty());
    }
}
