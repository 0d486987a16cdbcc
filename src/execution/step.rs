//! Individual Step Execution
//!
//! Handles the execution of a single tool-bearing step:
//! - Argument rendering against the step's attribute snapshot
//! - Fetch auto-wiring from earlier search results
//! - Report synthesis for `write_file` when no report exists yet
//! - Dispatch under the step's timeout and the run's cancellation token
//! - Conversion of the tool payload into an attribute delta

use std::borrow::Cow;
use std::time::Duration;

use log::debug;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::dispatch::ToolDispatcher;
use crate::attrs::{display_value, string_list_value, to_source_list, to_string_list, Attrs};
use crate::error::ExecutionError;
use crate::template::{render_args, resolve_path, select_from_json};
use crate::workflow::{Step, ToolRef};

/// Title used for fetched sources that report none.
const DEFAULT_SOURCE_TITLE: &str = "Research Report";

/// Fixed summary paragraph of a synthesized report.
const REPORT_SUMMARY: &str = "This report synthesizes information from multiple web sources.";

/// Result of a successful dispatch.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub payload: Vec<u8>,
    pub delta: Attrs,
    pub args: Value,
}

/// A failed step, with the rendered arguments when dispatch got that far.
#[derive(Debug)]
pub struct StepFailure {
    pub error: ExecutionError,
    pub args: Option<Value>,
}

impl StepFailure {
    pub fn new(error: ExecutionError) -> Self {
        Self { error, args: None }
    }
}

/// Executes a step's tool call against an attribute snapshot.
///
/// # Arguments
///
/// * `dispatcher` - Tool dispatch interface
/// * `cancel` - Run-scoped cancellation token
/// * `step` - The step; it must carry a tool
/// * `tool` - The step's tool reference
/// * `attrs` - Snapshot used for rendering and auto-wiring
pub async fn run_step(
    dispatcher: &dyn ToolDispatcher,
    cancel: &CancellationToken,
    step: &Step,
    tool: &ToolRef,
    attrs: &Attrs,
) -> Result<StepOutput, StepFailure> {
    // A write without a report in sight gets one built from the collected sources
    let report = (tool.name == "write_file" && !has_report(attrs)).then(|| build_report(attrs));
    let view = match &report {
        Some(report) => {
            let mut augmented = attrs.clone();
            augmented.insert("report_md".to_string(), Value::String(report.clone()));
            Cow::Owned(augmented)
        }
        None => Cow::Borrowed(attrs),
    };

    let mut args: Map<String, Value> = tool
        .args
        .iter()
        .map(|(k, v)| (k.clone(), render_args(v, &view)))
        .collect();

    if tool.name == "web_fetch" {
        wire_fetch_urls(&mut args, &view);
    }

    if let Some(report) = &report {
        let empty = args
            .get("content")
            .map_or(true, |content| display_value(content).is_empty());
        if empty {
            debug!("Step '{}' writes the synthesized report", step.id);
            args.insert("content".to_string(), Value::String(report.clone()));
        }
    }

    let args = Value::Object(args);
    let raw = serde_json::to_vec(&args).map_err(|source| StepFailure {
        error: ExecutionError::Encode {
            step: step.id.clone(),
            source,
        },
        args: Some(args.clone()),
    })?;

    let timeout = step.timeout.as_deref().and_then(parse_duration);
    debug!("Dispatching step '{}' -> {} (timeout: {:?})", step.id, tool.name, timeout);

    let step_cancel = cancel.child_token();
    let call = dispatcher.dispatch(&step_cancel, &tool.name, &raw);

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        result = with_timeout(timeout, call) => match result {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(source)) => Err(ExecutionError::Dispatch { step: step.id.clone(), source }),
            None => {
                step_cancel.cancel();
                Err(ExecutionError::Timeout {
                    step: step.id.clone(),
                    timeout: timeout.unwrap_or_default(),
                })
            }
        },
    };

    match result {
        Ok(payload) => {
            let mut delta = build_delta(step, &tool.name, &payload, &args);
            if let Some(report) = report {
                delta.insert("report_md".to_string(), Value::String(report));
            }
            Ok(StepOutput { payload, delta, args })
        }
        Err(error) => Err(StepFailure {
            error,
            args: Some(args),
        }),
    }
}

/// Awaits `fut`, giving up after `timeout` when one is set.
async fn with_timeout<F: std::future::Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Supplies fetch targets when the step names neither `url` nor `urls`.
fn wire_fetch_urls(args: &mut Map<String, Value>, attrs: &Attrs) {
    if args.contains_key("url") || args.contains_key("urls") {
        return;
    }

    match attrs.get("urls") {
        Some(urls) => {
            let urls = to_string_list(urls);
            if !urls.is_empty() {
                args.insert("urls".to_string(), string_list_value(urls));
            }
        }
        None => {
            if let Some(first) = attrs.get("first_url").and_then(Value::as_str) {
                if !first.is_empty() {
                    args.insert("url".to_string(), Value::String(first.to_string()));
                }
            }
        }
    }
}

fn has_report(attrs: &Attrs) -> bool {
    attrs
        .get("report_md")
        .and_then(Value::as_str)
        .is_some_and(|report| !report.is_empty())
}

/// Builds a Markdown research report from the collected `sources`.
///
/// The title is `query`, falling back to `utter`.
pub fn build_report(attrs: &Attrs) -> String {
    let text = |key: &str| attrs.get(key).map(display_value).unwrap_or_default();
    let title = match text("query") {
        q if q.is_empty() => text("utter"),
        q => q,
    };
    let sources = attrs.get("sources").map(to_source_list).unwrap_or_default();
    let field = |source: &Value, name: &str| source.get(name).and_then(Value::as_str).unwrap_or_default().to_string();

    let mut out = format!("# Deep Research Report: {}\n\n", title);
    if !sources.is_empty() {
        out.push_str("## Sources\n\n");
        for (i, source) in sources.iter().enumerate() {
            out.push_str(&format!("{}. {}\n   {}\n\n", i + 1, field(source, "url"), field(source, "title")));
        }
    }
    out.push_str("## Executive Summary\n\n");
    out.push_str(REPORT_SUMMARY);
    out.push_str("\n\n## Detailed Findings\n\n");
    for source in &sources {
        let heading = field(source, "title");
        if !heading.trim().is_empty() {
            out.push_str(&format!("### {}\n\n", heading.trim()));
        }
        let markdown = field(source, "markdown");
        if !markdown.is_empty() {
            out.push_str(&markdown);
            out.push_str("\n\n");
        }
    }
    out
}

/// Builds the attribute delta for a tool payload.
///
/// Every delta records `last_payload` and `payloads`. Well-known tools add
/// their conventional aliases, and an `output_attr` argument copies a chosen
/// value into the delta under that name.
pub fn build_delta(step: &Step, tool: &str, payload: &[u8], args: &Value) -> Attrs {
    let text = String::from_utf8_lossy(payload).into_owned();
    let parsed: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);

    let mut delta = Attrs::new();
    delta.insert("last_payload".to_string(), Value::String(text.clone()));
    delta.insert("payloads".to_string(), json!([text]));

    match tool {
        "web_search" => {
            let urls: Vec<String> = parsed
                .get("results")
                .and_then(Value::as_array)
                .map(|results| {
                    results
                        .iter()
                        .map(|r| r.get("url").and_then(Value::as_str).unwrap_or_default().to_string())
                        .collect()
                })
                .unwrap_or_default();

            if let Some(first) = urls.first() {
                delta.insert("first_url".to_string(), json!(first));
            }
            if let Some(second) = urls.get(1) {
                delta.insert("second_url".to_string(), json!(second));
            }
            delta.insert("urls".to_string(), string_list_value(urls));
        }
        "web_fetch" => {
            let field = |name: &str| parsed.get(name).and_then(Value::as_str).unwrap_or_default();

            let title = match field("title").trim() {
                "" => DEFAULT_SOURCE_TITLE,
                t => t,
            };
            let url = match field("final_url") {
                "" => field("input_url"),
                u => u,
            };
            let source = json!({"title": title, "url": url, "markdown": field("markdown")});

            delta.insert("sources".to_string(), json!([source.clone()]));
            delta.insert("first_source".to_string(), source);
            delta.insert("final_url".to_string(), json!(url));
        }
        "llm_transform" => {
            let output = parsed.get("output").and_then(Value::as_str).unwrap_or_default();
            if !output.is_empty() {
                delta.insert("llm_output".to_string(), json!(output));
                delta.insert("report_md".to_string(), json!(output));
            }
        }
        "write_file" => {
            let content = args.get("content").map(display_value).unwrap_or_default();
            delta.insert("report_md".to_string(), Value::String(content));
        }
        "utility_textbox" => {
            let text = parsed.get("text").and_then(Value::as_str).unwrap_or_default();
            let key = match parsed.get("output_attr").and_then(Value::as_str).map(str::trim) {
                Some(key) if !key.is_empty() => key.to_string(),
                _ => format!("{}_text", step.id),
            };
            delta.insert(key, json!(text));
        }
        _ => {}
    }

    if let Some((key, value)) = select_output_attr(args, &text, payload, &delta) {
        delta.insert(key, value);
    }

    delta
}

/// Resolves the generic `output_attr` / `output_value` / `output_from` arguments.
fn select_output_attr(args: &Value, text: &str, payload: &[u8], delta: &Attrs) -> Option<(String, Value)> {
    let key = args.get("output_attr")?.as_str()?.trim();
    if key.is_empty() {
        return None;
    }

    let value = match args.get("output_value") {
        Some(value) => Some(value.clone()),
        None => {
            let selector = args.get("output_from").and_then(Value::as_str)?.trim();
            if selector == "payload" {
                Some(Value::String(text.to_string()))
            } else if let Some(path) = selector.strip_prefix("json.") {
                select_from_json(payload, path)
            } else if let Some(path) = selector.strip_prefix("args.") {
                resolve_path(args, path)
            } else if let Some(path) = selector.strip_prefix("delta.") {
                resolve_path(&Value::Object(delta.clone()), path)
            } else {
                None
            }
        }
    };

    match value {
        None | Some(Value::Null) => None,
        Some(value) => Some((key.to_string(), value)),
    }
}

/// Parses a duration such as `"300ms"`, `"1.5s"` or `"1m30s"`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. Returns `None` for empty,
/// malformed, negative or zero durations.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    if rest.is_empty() || rest.starts_with('-') {
        return None;
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(num_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale = unit_nanos(unit)?;
        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return None;
        }

        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut nanos = whole.checked_mul(scale)?;
        if !frac.is_empty() {
            let digits: u128 = frac.parse().ok()?;
            let denom = 10u128.checked_pow(u32::try_from(frac.len()).ok()?)?;
            nanos = nanos.checked_add(digits.checked_mul(scale)? / denom)?;
        }

        total = total.checked_add(nanos)?;
        rest = tail;
    }

    if total == 0 {
        return None;
    }
    Some(Duration::from_nanos(u64::try_from(total).ok()?))
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use async_trait::async_trait;

    /// Replies with a fixed payload after an optional delay.
    struct FixedDispatcher {
        payload: Value,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ToolDispatcher for FixedDispatcher {
        async fn dispatch(
            &self,
            _cancel: &CancellationToken,
            _tool: &str,
            _args: &[u8],
        ) -> Result<Vec<u8>, BoxError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(serde_json::to_vec(&self.payload)?)
        }
    }

    fn attrs(value: Value) -> Attrs {
        match value {
            Value::Object(map) => map,
            _ => panic!("attrs must be an object"),
        }
    }

    async fn run(step: &Step, payload: Value, a: &Attrs) -> Result<StepOutput, StepFailure> {
        let dispatcher = FixedDispatcher { payload, delay: None };
        let tool = step.tool.clone().unwrap();
        run_step(&dispatcher, &CancellationToken::new(), step, &tool, a).await
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("250us"), Some(Duration::from_micros(250)));
        assert_eq!(parse_duration(".5s"), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        for input in ["", "abc", "-1s", "10", "0s", "1.2.3s", "5 days", "s"] {
            assert_eq!(parse_duration(input), None, "{:?} should not parse", input);
        }
    }

    #[test]
    fn test_search_delta() {
        let step = Step::new("s1", "search");
        let payload = json!({"ok": true, "results": [{"url": "http://a"}, {"url": "http://b"}, {"url": "http://c"}]});
        let delta = build_delta(&step, "web_search", payload.to_string().as_bytes(), &json!({}));

        assert_eq!(delta["first_url"], json!("http://a"));
        assert_eq!(delta["second_url"], json!("http://b"));
        assert_eq!(delta["urls"], json!(["http://a", "http://b", "http://c"]));
        assert_eq!(delta["payloads"], json!([payload.to_string()]));
        assert_eq!(delta["last_payload"], json!(payload.to_string()));
    }

    #[test]
    fn test_fetch_delta() {
        let step = Step::new("s2", "fetch");
        let payload = json!({"ok": true, "markdown": "# Hi", "input_url": "http://in"});
        let delta = build_delta(&step, "web_fetch", payload.to_string().as_bytes(), &json!({}));

        let expected = json!({"title": "Research Report", "url": "http://in", "markdown": "# Hi"});
        assert_eq!(delta["sources"], json!([expected.clone()]));
        assert_eq!(delta["first_source"], expected);
        assert_eq!(delta["final_url"], json!("http://in"));
    }

    #[test]
    fn test_llm_and_textbox_delta() {
        let step = Step::new("s3", "llm");
        let delta = build_delta(&step, "llm_transform", br#"{"output":"report"}"#, &json!({}));
        assert_eq!(delta["report_md"], json!("report"));
        assert_eq!(delta["llm_output"], json!("report"));

        let delta = build_delta(&step, "llm_transform", br#"{"output":""}"#, &json!({}));
        assert!(!delta.contains_key("report_md"));

        let step = Step::new("box", "textbox");
        let delta = build_delta(&step, "utility_textbox", br#"{"text":"hello"}"#, &json!({}));
        assert_eq!(delta["box_text"], json!("hello"));

        let delta = build_delta(&step, "utility_textbox", br#"{"text":"x","output_attr":"topic"}"#, &json!({}));
        assert_eq!(delta["topic"], json!("x"));
    }

    #[test]
    fn test_write_delta_carries_report() {
        let step = Step::new("s5", "write");
        let args = json!({"path": "report.md", "content": ""});
        let delta = build_delta(&step, "write_file", br#"{"ok":true}"#, &args);
        assert!(delta.contains_key("report_md"));

        let args = json!({"path": "report.md", "content": "# Done"});
        let delta = build_delta(&step, "write_file", br#"{"ok":true}"#, &args);
        assert_eq!(delta["report_md"], json!("# Done"));
    }

    #[test]
    fn test_build_report() {
        let a = attrs(json!({
            "utter": "rust runtimes",
            "sources": [
                {"title": "Tokio", "url": "http://tokio", "markdown": "Async runtime."},
                {"title": " ", "url": "http://bare", "markdown": ""}
            ]
        }));
        let report = build_report(&a);

        assert!(report.starts_with("# Deep Research Report: rust runtimes\n\n## Sources\n\n"));
        assert!(report.contains("1. http://tokio\n   Tokio\n\n2. http://bare\n"));
        assert!(report.contains("## Executive Summary\n\n"));
        assert!(report.ends_with("## Detailed Findings\n\n### Tokio\n\nAsync runtime.\n\n"));

        let a = attrs(json!({"query": "q", "utter": "u"}));
        let report = build_report(&a);
        assert!(report.starts_with("# Deep Research Report: q\n\n## Executive Summary"));
    }

    #[test]
    fn test_unknown_tool_non_json_payload() {
        let step = Step::new("s", "plain");
        let delta = build_delta(&step, "run_cli", b"plain text", &json!({}));
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["last_payload"], json!("plain text"));
    }

    #[test]
    fn test_output_attr_selectors() {
        let step = Step::new("s", "generic");
        let payload = br#"{"ok":true,"value":"XYZ","n":7}"#;

        let args = json!({"output_attr": "left", "output_from": "json.value"});
        assert_eq!(build_delta(&step, "echo_json", payload, &args)["left"], json!("XYZ"));

        let args = json!({"output_attr": "whole", "output_from": "payload"});
        assert_eq!(
            build_delta(&step, "echo_json", payload, &args)["whole"],
            json!(String::from_utf8_lossy(payload))
        );

        let args = json!({"output_attr": "copy", "output_from": "args.nested.k", "nested": {"k": 1}});
        assert_eq!(build_delta(&step, "echo_json", payload, &args)["copy"], json!(1));

        let args = json!({"output_attr": "last", "output_from": "delta.last_payload"});
        assert_eq!(
            build_delta(&step, "echo_json", payload, &args)["last"],
            json!(String::from_utf8_lossy(payload))
        );

        let args = json!({"output_attr": "none", "output_from": "bogus"});
        assert!(!build_delta(&step, "echo_json", payload, &args).contains_key("none"));
    }

    #[tokio::test]
    async fn test_output_value_is_rendered() {
        let step = Step::new("s2", "value").with_tool(
            ToolRef::new("echo_json")
                .with_arg("output_attr", "right_val")
                .with_arg("output_value", "${A.utter}"),
        );
        let a = attrs(json!({"utter": "hello"}));

        let out = run(&step, json!({"ok": true}), &a).await.unwrap();
        assert_eq!(out.delta["right_val"], json!("hello"));
        assert_eq!(out.args["output_value"], json!("hello"));
    }

    #[tokio::test]
    async fn test_fetch_auto_wiring() {
        let step = Step::new("f", "fetch").with_tool(ToolRef::new("web_fetch"));

        let a = attrs(json!({"urls": ["http://a", "http://b"], "first_url": "http://z"}));
        let out = run(&step, json!({}), &a).await.unwrap();
        assert_eq!(out.args["urls"], json!(["http://a", "http://b"]));
        assert!(out.args.get("url").is_none());

        let a = attrs(json!({"first_url": "http://z"}));
        let out = run(&step, json!({}), &a).await.unwrap();
        assert_eq!(out.args["url"], json!("http://z"));

        let explicit = Step::new("f", "fetch").with_tool(ToolRef::new("web_fetch").with_arg("url", "http://x"));
        let out = run(&explicit, json!({}), &a).await.unwrap();
        assert_eq!(out.args, json!({"url": "http://x"}));
    }

    #[tokio::test]
    async fn test_write_file_synthesizes_report() {
        let step = Step::new("s5", "write").with_tool(
            ToolRef::new("write_file")
                .with_arg("path", "report.md")
                .with_arg("content", "${A.report_md}"),
        );
        let a = attrs(json!({
            "query": "topic",
            "sources": [{"title": "Page", "url": "http://p", "markdown": "Body text"}]
        }));

        let out = run(&step, json!({"ok": true}), &a).await.unwrap();
        let content = out.args["content"].as_str().unwrap();
        assert!(content.starts_with("# Deep Research Report: topic"));
        assert!(content.contains("Body text"));
        assert_eq!(out.delta["report_md"], json!(content));

        // Empty content falls back to the report
        let blank = Step::new("s5", "write").with_tool(ToolRef::new("write_file").with_arg("path", "r.md"));
        let out = run(&blank, json!({"ok": true}), &a).await.unwrap();
        assert_eq!(out.args["content"], out.delta["report_md"]);
    }

    #[tokio::test]
    async fn test_write_file_keeps_existing_report() {
        let step = Step::new("s5", "write").with_tool(
            ToolRef::new("write_file")
                .with_arg("path", "report.md")
                .with_arg("content", "${A.report_md}"),
        );
        let a = attrs(json!({"report_md": "# Refined", "sources": [{"title": "x", "url": "y", "markdown": "z"}]}));

        let out = run(&step, json!({"ok": true}), &a).await.unwrap();
        assert_eq!(out.args["content"], json!("# Refined"));
        assert_eq!(out.delta["report_md"], json!("# Refined"));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let step = Step::new("slow", "slow")
            .with_tool(ToolRef::new("sleepy"))
            .with_timeout("20ms");
        let dispatcher = FixedDispatcher {
            payload: json!({}),
            delay: Some(Duration::from_secs(5)),
        };
        let tool = step.tool.clone().unwrap();

        let failure = run_step(&dispatcher, &CancellationToken::new(), &step, &tool, &Attrs::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ExecutionError::Timeout { .. }));
        assert_eq!(failure.args, Some(json!({})));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_completes() {
        let step = Step::new("slow", "slow").with_tool(ToolRef::new("sleepy"));
        let dispatcher = FixedDispatcher {
            payload: json!({}),
            delay: Some(Duration::from_secs(5)),
        };
        let tool = step.tool.clone().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = run_step(&dispatcher, &cancel, &step, &tool, &Attrs::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ExecutionError::Cancelled));
    }
}
