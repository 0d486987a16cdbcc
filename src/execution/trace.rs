//! Step Trace
//!
//! Per-step records collected when a run is traced.

use serde::Serialize;
use serde_json::Value;

use crate::attrs::Attrs;

/// Terminal state of a step.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Completed,
    Skipped,
    Noop,
    Error,
}

/// What happened to one step of a run.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StepTrace {
    pub step_id: String,
    pub text: String,
    pub status: StepStatus,

    /// Arguments actually sent to the tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered_args: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<Attrs>,

    /// Raw tool output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepTrace {
    pub fn new(step_id: impl Into<String>, text: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            text: text.into(),
            status,
            rendered_args: None,
            delta: None,
            payload: None,
            error: None,
        }
    }
}
