//! Error Types
//!
//! Error taxonomy for workflow validation, registry operations and
//! run-time execution.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::execution::trace::StepTrace;

/// Boxed error returned by external collaborators (tools, publishers, stores).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Structural problems detected before a workflow may be registered or run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Step has empty ID")]
    EmptyStepId,

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Workflow contains cyclic dependencies (steps depend on each other in a loop)")]
    CyclicDependency,
}

/// Failures raised by the workflow registry and on-disk persistence.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Workflow intent is required")]
    MissingIntent,

    #[error("Workflow not found: '{0}'")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode workflow: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Workflow store error: {0}")]
    Store(#[source] BoxError),
}

/// Errors that end a step (and, unless softened, the whole run).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Tool not permitted: '{tool}' (step '{step}')")]
    DisallowedTool { step: String, tool: String },

    #[error("Step '{step}' failed: {source}")]
    Dispatch {
        step: String,
        #[source]
        source: BoxError,
    },

    #[error("Step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("Panic in step '{step}': {message}")]
    Panic { step: String, message: String },

    #[error("Failed to encode arguments for step '{step}': {source}")]
    Encode {
        step: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(#[from] ValidationError),
}

impl ExecutionError {
    /// Returns true if `continue_on_error` may turn this error into a soft failure.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::DisallowedTool { .. } | Self::Cancelled | Self::InvalidWorkflow(_)
        )
    }
}

/// A fatal run error together with the trace collected before it happened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: ExecutionError,
    pub trace: Vec<StepTrace>,
}
