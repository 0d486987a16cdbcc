//! Workflow Preprocessing
//!
//! Rewrites applied to the run-local copy of a workflow before execution:
//! - Short aliases such as `${A.first_url}` become producer-scoped
//!   placeholders (`${A.<step>.first_url}`) when an earlier step's tool is
//!   known to produce that alias.
//! - Absolute or drive-rooted `write_file` paths are moved under `tmp/`.

use std::collections::HashMap;

use log::debug;
use once_cell::sync::Lazy;
use serde_json::Value;

use super::model::Workflow;

/// Attribute aliases conventionally produced by each tool.
pub static TOOL_ALIASES: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    table.insert("web_search", &["first_url", "second_url", "urls"]);
    table.insert("web_fetch", &["first_source", "final_url"]);
    table.insert("llm_transform", &["report_md", "llm_output"]);
    table
});

/// Root directory for rewritten `write_file` targets.
const WRITE_ROOT: &str = "tmp";

/// Returns the preprocessed, run-local copy of `workflow`.
pub fn preprocess_workflow(workflow: &Workflow) -> Workflow {
    let mut out = workflow.clone();

    // alias -> most recent producing step, as seen by each step in turn
    let mut producers: HashMap<&'static str, String> = HashMap::new();

    for step in &mut out.steps {
        let Some(tool) = step.tool.as_mut() else {
            continue;
        };

        if !producers.is_empty() {
            for value in tool.args.values_mut() {
                rewrite_aliases(value, &producers);
            }
        }

        if tool.name == "write_file" {
            if let Some(Value::String(path)) = tool.args.get_mut("path") {
                if let Some(safe) = confine_path(&step.id, path) {
                    debug!("Step '{}': write path '{}' -> '{}'", step.id, path, safe);
                    *path = safe;
                }
            }
        }

        if let Some(aliases) = TOOL_ALIASES.get(tool.name.as_str()) {
            for &alias in aliases.iter() {
                producers.insert(alias, step.id.clone());
            }
        }
    }

    out
}

fn rewrite_aliases(value: &mut Value, producers: &HashMap<&'static str, String>) {
    match value {
        Value::String(s) => {
            for (alias, producer) in producers {
                let short = format!("${{A.{}}}", alias);
                if s.contains(&short) {
                    *s = s.replace(&short, &format!("${{A.{}.{}}}", producer, alias));
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_aliases(v, producers)),
        Value::Object(map) => map.values_mut().for_each(|v| rewrite_aliases(v, producers)),
        _ => {}
    }
}

/// Maps an absolute or drive-rooted path to `tmp/<step>_<basename>`.
fn confine_path(step_id: &str, path: &str) -> Option<String> {
    if !path.starts_with('/') && !path.contains(":\\") {
        return None;
    }
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    Some(format!("{}/{}_{}", WRITE_ROOT, step_id, base))
}
