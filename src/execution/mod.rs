//! Workflow Execution Module
//!
//! Provides the engine that runs a prepared workflow against an attribute
//! bag, dispatching tool calls through an external interface.
//!
//! # Architecture
//!
//! - [`engine`]: Sequential and DAG scheduling, fail-fast, publication
//! - [`step`]: Single step execution and delta construction
//! - [`blackboard`]: Attribute state, deterministic merge and snapshots
//! - [`dispatch`]: Tool dispatch and result publisher interfaces
//! - [`trace`]: Per-step trace records

pub mod blackboard;
pub mod dispatch;
pub mod engine;
pub mod step;
pub mod trace;


pub use blackboard::{merge_delta, record_step_result, Blackboard};
pub use dispatch::{DryRunDispatcher, StepPublisher, ToolDispatcher};
pub use engine::Engine;
pub use step::parse_duration;
pub use trace::{StepStatus, StepTrace};
