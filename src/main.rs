//! WARPP CLI Entry Point
//!
//! Provides a command-line interface for previewing workflow runs.
//!
//! # Usage
//!
//! ```bash
//! # Detect the intent from an utterance and run it
//! warpp echo hello world
//!
//! # Pick the intent explicitly and print the step trace
//! warpp --intent deep_web_report --trace rust async runtimes
//!
//! # List registered workflows
//! warpp --workflows ./workflows --list
//!
//! # Validate a workflow and show its execution order
//! warpp --intent cli_echo --validate
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use serde_json::Value;

use warpp::execution::{DryRunDispatcher, Engine};
use warpp::workflow::validator::topological_order;
use warpp::workflow::{allowed_tools, personalize, validate_workflow, Registry};
use warpp::{Attrs, APP_NAME, VERSION};

/// Default workflow directory used when none is specified.
const DEFAULT_WORKFLOWS_DIR: &str = "workflows";

/// Environment variable overriding the workflow directory.
const WORKFLOWS_DIR_ENV: &str = "WARPP_WORKFLOWS_DIR";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflows_dir: PathBuf,
    intent: Option<String>,
    utterance: Vec<String>,
    trace: bool,
    list: bool,
    validate: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        let workflows_dir = env::var(WORKFLOWS_DIR_ENV)
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WORKFLOWS_DIR.to_string());

        Self {
            workflows_dir: PathBuf::from(workflows_dir),
            intent: None,
            utterance: Vec::new(),
            trace: false,
            list: false,
            validate: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine (dry run)");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: warpp [OPTIONS] [UTTERANCE...]");
    println!();
    println!("Arguments:");
    println!("  [UTTERANCE...]      Request text, used for intent detection and as A.utter");
    println!();
    println!("Options:");
    println!(
        "  --workflows DIR     Workflow directory (default: {}, env: {})",
        DEFAULT_WORKFLOWS_DIR, WORKFLOWS_DIR_ENV
    );
    println!("  --intent NAME       Run this intent instead of detecting one");
    println!("  --trace             Print the step trace as JSON");
    println!("  --list              List registered workflows");
    println!("  --validate          Validate the workflow and show its execution order");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  warpp echo hello world");
    println!("  warpp --intent deep_web_report --trace rust async runtimes");
    println!("  warpp --workflows ./workflows --list");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--trace" => {
                config.trace = true;
            }
            "--list" => {
                config.list = true;
            }
            "--validate" => {
                config.validate = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--workflows" => {
                i += 1;
                if i >= args.len() {
                    return Err("--workflows requires a directory argument".to_string());
                }
                config.workflows_dir = PathBuf::from(&args[i]);
            }
            "--intent" => {
                i += 1;
                if i >= args.len() {
                    return Err("--intent requires a name argument".to_string());
                }
                config.intent = Some(args[i].clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional words form the utterance
                config.utterance.push(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints every registered workflow in registration order.
fn list_workflows(registry: &Registry) {
    println!("Registered workflows ({}):", registry.len());
    for workflow in registry.all() {
        let source = registry
            .path(&workflow.intent)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in".to_string());
        println!(
            "  {:<20} {} step(s)  [{}]  {}",
            workflow.intent,
            workflow.len(),
            source,
            workflow.description
        );
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load workflows
    info!("Loading workflows from: {}", config.workflows_dir.display());
    let registry = Registry::load_from_dir(&config.workflows_dir);
    info!("{} workflow(s) registered", registry.len());

    if config.list {
        list_workflows(&registry);
        return Ok(());
    }

    let utterance = config.utterance.join(" ");
    let intent = match config.intent {
        Some(intent) => intent,
        None => registry.detect_intent(&utterance),
    };
    info!("Intent: {}", intent);

    let workflow = registry.get(&intent).map_err(|e| {
        error!("{}", e);
        e
    })?;

    if config.validate {
        validate_workflow(workflow)?;
        let order = topological_order(workflow)?;
        println!("Workflow '{}' is valid ({} steps)", workflow.intent, workflow.len());
        println!("Execution order:");
        for (position, idx) in order.iter().enumerate() {
            let step = &workflow.steps[*idx];
            println!(
                "  {}. {} - {} [{}]",
                position + 1,
                step.id,
                step.text,
                step.tool_name().unwrap_or("no-op")
            );
        }
        return Ok(());
    }

    // Prepare the run
    let mut attrs = Attrs::new();
    if !utterance.is_empty() {
        attrs.insert("utter".to_string(), Value::String(utterance));
    }
    let prepared = personalize(workflow, &mut attrs);
    let allowed = allowed_tools(&prepared);

    // Execute workflow
    let runtime = tokio::runtime::Runtime::new()?;
    let engine = Engine::new(Arc::new(DryRunDispatcher));
    let (summary, trace) = runtime
        .block_on(engine.execute_with_trace(&prepared, &allowed, &mut attrs))
        .map_err(|failure| {
            if config.trace {
                if let Ok(json) = serde_json::to_string_pretty(&failure.trace) {
                    println!("{}", json);
                }
            }
            failure
        })?;

    println!();
    print!("{}", summary);

    if config.trace {
        println!();
        println!("{}", serde_json::to_string_pretty(&trace)?);
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("warpp")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_utterance_and_flags() {
        let config = parse_arguments(&args(&["--trace", "echo", "hello", "--intent", "cli_echo"])).unwrap();
        assert_eq!(config.utterance, vec!["echo", "hello"]);
        assert_eq!(config.intent.as_deref(), Some("cli_echo"));
        assert!(config.trace);
        assert!(!config.list);
    }

    #[test]
    fn test_parse_workflows_dir() {
        let config = parse_arguments(&args(&["--workflows", "/tmp/flows", "--list"])).unwrap();
        assert_eq!(config.workflows_dir, PathBuf::from("/tmp/flows"));
        assert!(config.list);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&["--intent"])).is_err());
        assert!(parse_arguments(&args(&["--bogus"])).is_err());
    }
}
