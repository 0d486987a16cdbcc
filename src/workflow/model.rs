//! Workflow Data Model
//!
//! Core data structures representing workflows, their steps and the tool
//! calls those steps make.
//!
//! # Example JSON Format
//!
//! ```json
//! {
//!   "intent": "web_research",
//!   "description": "Search the web and fetch the first result",
//!   "keywords": ["web", "search"],
//!   "steps": [
//!     {
//!       "id": "s1",
//!       "text": "Search the web for the topic",
//!       "tool": { "name": "web_search", "args": { "query": "${A.query}" } }
//!     },
//!     {
//!       "id": "s2",
//!       "text": "Fetch the first result",
//!       "guard": "A.first_url",
//!       "tool": { "name": "web_fetch", "args": { "url": "${A.first_url}" } },
//!       "depends_on": ["s1"],
//!       "timeout": "30s"
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A tool invocation: the tool name plus its argument tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ToolRef {
    pub name: String,

    /// Arguments; string leaves may contain `${A.path}` placeholders
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
        }
    }

    /// Adds an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// When a published step result is delivered.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// As soon as the step completes
    #[default]
    Immediate,
    /// Buffered until the run ends, then flushed in admission order
    Topo,
}

impl PublishMode {
    fn is_immediate(&self) -> bool {
        *self == Self::Immediate
    }
}

/// Reads a publish mode leniently: anything other than `topo` is immediate.
fn lenient_publish_mode<'de, D>(deserializer: D) -> Result<PublishMode, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) if s.trim().eq_ignore_ascii_case("topo") => Ok(PublishMode::Topo),
        _ => Ok(PublishMode::Immediate),
    }
}

/// Represents a single step in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Human-readable label, carried into summaries and traces
    #[serde(default)]
    pub text: String,

    /// Guard expression; empty means always eligible
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guard: String,

    /// Tool call; a step without one is a no-op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,

    /// IDs of steps that must finish before this step can run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Turn dispatch failures into soft errors
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_error: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub publish_result: bool,

    #[serde(
        default,
        deserialize_with = "lenient_publish_mode",
        skip_serializing_if = "PublishMode::is_immediate"
    )]
    pub publish_mode: PublishMode,

    /// Duration string such as `"1.5s"` or `"1m30s"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Reserved; carried but not enforced
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Step {
    /// Creates a new no-op step.
    ///
    /// # Example
    ///
    /// ```
    /// use warpp::workflow::{Step, ToolRef};
    ///
    /// let step = Step::new("s2", "Fetch the first result")
    ///     .with_tool(ToolRef::new("web_fetch").with_arg("url", "${A.first_url}"))
    ///     .with_guard("A.first_url")
    ///     .depends_on("s1");
    /// ```
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            text: text.into(),
            ..Self::default()
        }
    }

    /// Sets the tool call.
    pub fn with_tool(mut self, tool: ToolRef) -> Self {
        self.tool = Some(tool);
        self
    }

    /// Sets the guard expression.
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = guard.into();
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Sets the per-step timeout.
    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Marks dispatch failures of this step as non-fatal.
    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Publishes the step's payload with the given mode.
    pub fn publish(mut self, mode: PublishMode) -> Self {
        self.publish_result = true;
        self.publish_mode = mode;
        self
    }

    /// Returns the tool name, if the step has a tool.
    pub fn tool_name(&self) -> Option<&str> {
        self.tool.as_ref().map(|t| t.name.as_str())
    }
}

/// A named, keyword-addressable plan of steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    /// Unique catalog key
    pub intent: String,

    #[serde(default)]
    pub description: String,

    /// Keywords scored during intent detection
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Ordered steps; declaration order breaks every scheduling tie
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Opaque editor metadata, passed through unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,

    /// Concurrent step limit (0 or absent is unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Self::default()
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(intent: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Self::new(intent)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Removes a step and every dependency edge pointing at it.
    pub fn remove_step(&mut self, id: &str) -> Result<Step, String> {
        let index = self
            .steps
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| format!("Step '{}' not found", id))?;

        for step in &mut self.steps {
            step.depends_on.retain(|d| d != id);
        }

        Ok(self.steps.remove(index))
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// True if any step declares a dependency (DAG mode).
    pub fn has_dependencies(&self) -> bool {
        self.steps.iter().any(|s| !s.depends_on.is_empty())
    }

    /// Effective concurrency limit; 0 means unbounded.
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrency.unwrap_or(0)
    }

    /// Unique tool names referenced by the steps, sorted.
    pub fn tool_names(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self.steps.iter().filter_map(Step::tool_name).collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
