//! WARPP - Workflow Execution Engine
//!
//! Turns declarative, dependency-annotated plans of tool invocations into
//! correctly ordered, partially concurrent runs over a shared attribute bag,
//! with guarded steps, templated arguments and deterministic merging.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow model, validation, registry and run preparation
//! - [`execution`]: Scheduling engine, tool dispatch and tracing
//! - [`guard`]: Step guard expressions
//! - [`template`]: `${A.path}` placeholder resolution
//! - [`attrs`]: The attribute bag and its coercion helpers
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use warpp::execution::{DryRunDispatcher, Engine};
//! use warpp::workflow::{allowed_tools, personalize, Registry};
//! use warpp::Attrs;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load workflows, falling back to the built-in defaults
//!     let registry = Registry::load_from_dir("workflows");
//!     let intent = registry.detect_intent("please echo hello");
//!     let workflow = registry.get(&intent)?;
//!
//!     // Prepare the run
//!     let mut attrs = Attrs::new();
//!     attrs.insert("utter".into(), "hello".into());
//!     let run = personalize(workflow, &mut attrs);
//!
//!     // Execute it
//!     let engine = Engine::new(Arc::new(DryRunDispatcher));
//!     let summary = engine.execute(&run, &allowed_tools(&run), &mut attrs).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod attrs;
pub mod error;
pub mod execution;
pub mod guard;
pub mod template;
pub mod workflow;

// Re-export commonly used types
pub use attrs::Attrs;
pub use error::{BoxError, ExecutionError, RegistryError, RunFailure, ValidationError};
pub use execution::engine::Engine;
pub use workflow::model::{Step, ToolRef, Workflow};
pub use workflow::registry::Registry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "WARPP";
