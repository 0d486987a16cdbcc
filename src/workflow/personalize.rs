//! Workflow Personalization
//!
//! Infers basic attributes for a run and statically prunes steps whose
//! guards already fail against them.

use std::collections::HashSet;

use log::{debug, info};
use serde_json::Value;

use super::model::Workflow;
use crate::attrs::Attrs;
use crate::guard::eval_guard;

/// Fills in the standard attributes and returns the pruned run workflow.
///
/// - `utter` defaults to `echo`, then to `query`
/// - `query` is set to `utter`
/// - `os` is set to the host operating system
///
/// Steps whose guard is false are removed, along with any dependency edges
/// that pointed at them, so the result stays a valid workflow.
pub fn personalize(workflow: &Workflow, attrs: &mut Attrs) -> Workflow {
    if !attrs.contains_key("utter") {
        if let Some(v) = attrs.get("echo").or_else(|| attrs.get("query")).cloned() {
            attrs.insert("utter".to_string(), v);
        }
    }
    let utter = attrs.get("utter").cloned().unwrap_or(Value::Null);
    attrs.insert("query".to_string(), utter);
    attrs.insert("os".to_string(), Value::String(std::env::consts::OS.to_string()));

    let mut out = workflow.clone();
    let pruned: Vec<String> = out
        .steps
        .iter()
        .filter(|s| !s.guard.is_empty() && !eval_guard(&s.guard, attrs))
        .map(|s| s.id.clone())
        .collect();

    for id in &pruned {
        debug!("Pruning step '{}' (guard false)", id);
        if let Err(e) = out.remove_step(id) {
            debug!("{}", e);
        }
    }

    info!(
        "Personalized '{}': {} of {} steps kept",
        out.intent,
        out.steps.len(),
        workflow.steps.len()
    );
    out
}

/// Tool names the workflow may dispatch.
pub fn allowed_tools(workflow: &Workflow) -> HashSet<String> {
    workflow.tool_names().into_iter().collect()
}
