//! External Collaborators
//!
//! The engine reaches tools and result consumers only through these traits.
//! Implementations must be safe to call concurrently.

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// Invokes a named tool with JSON-encoded arguments.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Returns the tool's JSON payload.
    ///
    /// `cancel` fires when the run aborts or the step's deadline passes.
    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        tool: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, BoxError>;
}

/// Best-effort consumer of published step results.
#[async_trait]
pub trait StepPublisher: Send + Sync {
    async fn publish(
        &self,
        cancel: &CancellationToken,
        step_id: &str,
        payload: &[u8],
    ) -> Result<(), BoxError>;
}

/// Dispatcher that performs no tool calls.
///
/// Each call answers `{"ok": true, "tool": <name>, "args": <arguments>}`,
/// which makes it useful for previewing how a workflow renders.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunDispatcher;

#[async_trait]
impl ToolDispatcher for DryRunDispatcher {
    async fn dispatch(
        &self,
        _cancel: &CancellationToken,
        tool: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, BoxError> {
        let args: Value = serde_json::from_slice(args)?;
        info!("[DRY RUN] {} {}", tool, args);

        let payload = json!({"ok": true, "tool": tool, "args": args});
        Ok(serde_json::to_vec(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_echoes_args() {
        let cancel = CancellationToken::new();
        let payload = DryRunDispatcher
            .dispatch(&cancel, "run_cli", br#"{"command":"echo","args":["hi"]}"#)
            .await
            .unwrap();

        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["tool"], "run_cli");
        assert_eq!(value["args"]["args"][0], "hi");
    }

    #[tokio::test]
    async fn test_dry_run_rejects_invalid_json() {
        let cancel = CancellationToken::new();
        assert!(DryRunDispatcher.dispatch(&cancel, "x", b"{oops").await.is_err());
    }
}
