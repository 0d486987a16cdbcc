//! Built-in Workflows
//!
//! Seeded into an empty registry so intent detection always has a target.

use serde_json::json;

use super::model::{Step, ToolRef, Workflow};

/// Intent returned when no workflow keyword matches.
pub const DEFAULT_INTENT: &str = "cli_echo";

/// Returns the built-in workflow set.
pub fn default_workflows() -> Vec<Workflow> {
    vec![deep_web_report(), cli_echo()]
}

fn deep_web_report() -> Workflow {
    Workflow::from_steps(
        "deep_web_report",
        vec![
            Step::new("s1", "Search the web for the topic").with_tool(
                ToolRef::new("web_search")
                    .with_arg("query", "${A.query}")
                    .with_arg("max_results", 5)
                    .with_arg("category", "general"),
            ),
            Step::new("s2", "Fetch the first result's content")
                .with_guard("A.first_url")
                .with_tool(
                    ToolRef::new("web_fetch")
                        .with_arg("url", "${A.first_url}")
                        .with_arg("prefer_readable", true),
                ),
            Step::new("s3", "Fetch the second result's content")
                .with_guard("A.second_url")
                .with_tool(
                    ToolRef::new("web_fetch")
                        .with_arg("url", "${A.second_url}")
                        .with_arg("prefer_readable", true),
                ),
            Step::new("s4", "Refine the report with the LLM").with_tool(
                ToolRef::new("llm_transform")
                    .with_arg(
                        "instruction",
                        "Rewrite into a coherent, well-structured deep research report \
                         with an executive summary, sections, and citations if present.",
                    )
                    .with_arg("input", "${A.report_md}"),
            ),
            Step::new("s5", "Write report to report.md").with_tool(
                ToolRef::new("write_file")
                    .with_arg("path", "report.md")
                    .with_arg("content", "${A.report_md}"),
            ),
            Step::new("s6", "Echo report to console (unix)")
                .with_guard("A.os != 'windows'")
                .with_tool(
                    ToolRef::new("run_cli")
                        .with_arg("command", "cat")
                        .with_arg("args", json!(["report.md"])),
                ),
            Step::new("s7", "Echo report to console (windows)")
                .with_guard("A.os == 'windows'")
                .with_tool(
                    ToolRef::new("run_cli")
                        .with_arg("command", "type")
                        .with_arg("args", json!(["report.md"])),
                ),
        ],
    )
    .with_description(
        "Research a topic on the web and write a deep research style report to report.md",
    )
    .with_keywords(&["report", "report.md", "write", "deep research", "research"])
}

fn cli_echo() -> Workflow {
    Workflow::from_steps(
        DEFAULT_INTENT,
        vec![Step::new("s1", "Echo the utterance").with_tool(
            ToolRef::new("run_cli")
                .with_arg("command", "echo")
                .with_arg("args", json!(["${A.utter}"])),
        )],
    )
    .with_description("Echo the user's input via run_cli tool")
    .with_keywords(&["echo", "print", "say"])
}
