//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, validating,
//! storing and preparing workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, Step, ToolRef)
//! - [`validator`]: Validation rules and dependency checking
//! - [`registry`]: Intent-keyed catalog with directory/store loading
//! - [`personalize`]: Attribute inference and static guard pruning
//! - [`preprocess`]: Alias rewriting and write-path confinement

pub mod builtin;
pub mod model;
pub mod personalize;
pub mod preprocess;
pub mod registry;
pub mod store;
pub mod validator;

pub use builtin::{default_workflows, DEFAULT_INTENT};
pub use model::{PublishMode, Step, ToolRef, Workflow};
pub use personalize::{allowed_tools, personalize};
pub use preprocess::preprocess_workflow;
pub use registry::{sanitize_intent, save_workflow, save_workflow_to_path, Registry};
pub use store::{MemoryWorkflowStore, WorkflowStore};
pub use validator::validate_workflow;
