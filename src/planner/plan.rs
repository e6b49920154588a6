use super::validate::sanitize_step;
use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub type Args = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Args,
}

/// One plan step. `step` is 1-based and always equals its index + 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step: usize,
    pub action: String,
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Args>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_edit: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Step {
    pub fn new(action: impl Into<String>, thought: impl Into<String>) -> Self {
        Self {
            step: 0,
            action: action.into(),
            thought: thought.into(),
            ui_text: None,
            tool: None,
            args: None,
            tool_calls: Vec::new(),
            files_to_edit: Vec::new(),
            notes: None,
        }
    }

    pub fn with_tool(mut self, tool: &str, args: Value) -> Self {
        self.tool = Some(tool.to_string());
        self.args = args.as_object().cloned();
        self
    }

    /// Normalize `tool` / `tool_calls` into one tool + args pair. `"auto"`
    /// counts as no tool.
    pub fn tool_call(&self) -> (Option<String>, Option<Args>) {
        let named = self
            .tool
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("auto"));
        if let Some(tool) = named {
            return (Some(tool.to_string()), self.args.clone());
        }
        if self.tool.is_none() {
            if let Some(call) = self.tool_calls.first() {
                return (Some(call.tool.clone()), Some(call.args.clone()));
            }
        }
        (None, self.args.clone())
    }

    /// Text describing what the step should do, for prompts and heuristics
    pub fn description(&self) -> String {
        let mut text = self.action.clone();
        if !self.thought.is_empty() {
            text.push('\n');
            text.push_str(&self.thought);
        }
        if let Some(ui) = &self.ui_text {
            text.push('\n');
            text.push_str(ui);
        }
        text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.step = i + 1;
        }
    }

    /// Insert `step` at 0-based `index` (`index == len` appends). Executed
    /// indices at or after the insertion point move up by one.
    pub fn insert_step(
        &mut self,
        executed: &mut BTreeSet<usize>,
        index: usize,
        mut step: Step,
    ) -> AgentResult<()> {
        if index > self.steps.len() {
            return Err(AgentError::invalid_request(format!(
                "Insert index {} out of range (plan has {} steps)",
                index,
                self.steps.len()
            )));
        }
        sanitize_step(&mut step);
        self.steps.insert(index, step);
        self.renumber();
        *executed = executed
            .iter()
            .map(|&i| if i >= index { i + 1 } else { i })
            .collect();
        Ok(())
    }

    /// Remove the step at 0-based `index`. Its executed mark is discarded and
    /// later indices move down by one.
    pub fn delete_step(&mut self, executed: &mut BTreeSet<usize>, index: usize) -> AgentResult<Step> {
        if index >= self.steps.len() {
            return Err(AgentError::invalid_request(format!(
                "Step index {} out of range (plan has {} steps)",
                index,
                self.steps.len()
            )));
        }
        let removed = self.steps.remove(index);
        self.renumber();
        *executed = executed
            .iter()
            .filter(|&&i| i != index)
            .map(|&i| if i > index { i - 1 } else { i })
            .collect();
        Ok(removed)
    }

    /// Merge a JSON object patch into the step at `index`. The `step` field is
    /// never taken from the patch; the step is marked not executed.
    pub fn update_step(
        &mut self,
        executed: &mut BTreeSet<usize>,
        index: usize,
        patch: &Args,
    ) -> AgentResult<&Step> {
        let Some(current) = self.steps.get(index) else {
            return Err(AgentError::invalid_request(format!(
                "Step index {} out of range (plan has {} steps)",
                index,
                self.steps.len()
            )));
        };

        let mut value = serde_json::to_value(current)?;
        if let Some(obj) = value.as_object_mut() {
            for (key, v) in patch {
                if key == "step" {
                    continue;
                }
                if v.is_null() {
                    obj.remove(key);
                } else {
                    obj.insert(key.clone(), v.clone());
                }
            }
        }
        let mut updated: Step = serde_json::from_value(value)
            .map_err(|e| AgentError::invalid_request(format!("Invalid step patch: {}", e)))?;
        sanitize_step(&mut updated);

        self.steps[index] = updated;
        self.renumber();
        executed.remove(&index);
        Ok(&self.steps[index])
    }
}
