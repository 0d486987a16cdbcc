//! Workflow Registry
//!
//! In-memory catalog of workflows keyed by intent.
//!
//! Workflows come from a directory of `.json` (or `.yaml`/`.yml`) files, from
//! an external [`WorkflowStore`], or from the built-in defaults when neither
//! source yields anything. Invalid entries are skipped, never fatal.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde_json::Value;

use super::builtin::{default_workflows, DEFAULT_INTENT};
use super::model::Workflow;
use super::store::WorkflowStore;
use super::validator::validate_workflow;
use crate::error::RegistryError;

/// Catalog of validated workflows, remembering registration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    workflows: HashMap<String, Workflow>,
    order: Vec<String>,
    paths: HashMap<String, PathBuf>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding only the built-in workflows.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.seed_defaults();
        registry
    }

    /// Loads every workflow file found under `dir`, recursively.
    ///
    /// Files are visited in lexical path order. Unreadable, unparsable or
    /// invalid files are skipped. A missing directory is not an error; if
    /// nothing loads, the built-in defaults are seeded.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use warpp::workflow::Registry;
    ///
    /// let registry = Registry::load_from_dir("workflows");
    /// let intent = registry.detect_intent("write a research report on tokio");
    /// println!("Selected intent: {}", intent);
    /// ```
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut registry = Self::new();

        let mut files = Vec::new();
        if dir.is_dir() {
            collect_workflow_files(dir, &mut files);
        } else {
            info!("Workflow directory not found: {}", dir.display());
        }

        for path in files {
            match read_workflow_file(&path) {
                Ok(workflow) => {
                    if let Err(e) = registry.upsert(workflow, Some(path.clone())) {
                        warn!("Skipping workflow '{}': {}", path.display(), e);
                    }
                }
                Err(e) => warn!("Skipping workflow '{}': {}", path.display(), e),
            }
        }

        if registry.is_empty() {
            registry.seed_defaults();
        }

        info!(
            "Registry loaded {} workflows from {}",
            registry.len(),
            dir.display()
        );
        registry
    }

    /// Loads workflows from an external store.
    ///
    /// `init` is best-effort; a failing `list_workflows` is returned as an
    /// error. Records that do not decode or validate are skipped. Without a
    /// store, or when the store yields nothing, the defaults are seeded.
    pub async fn load_from_store(store: Option<&dyn WorkflowStore>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();

        if let Some(store) = store {
            if let Err(e) = store.init().await {
                warn!("Workflow store init failed: {}", e);
            }

            let records = store.list_workflows().await.map_err(RegistryError::Store)?;
            for record in records {
                match serde_json::from_value::<Workflow>(record) {
                    Ok(workflow) => {
                        let intent = workflow.intent.clone();
                        if let Err(e) = registry.upsert(workflow, None) {
                            warn!("Skipping stored workflow '{}': {}", intent, e);
                        }
                    }
                    Err(e) => warn!("Skipping undecodable workflow record: {}", e),
                }
            }
        }

        if registry.is_empty() {
            registry.seed_defaults();
        }

        Ok(registry)
    }

    /// Gets a workflow by intent.
    pub fn get(&self, intent: &str) -> Result<&Workflow, RegistryError> {
        self.workflows
            .get(intent)
            .ok_or_else(|| RegistryError::NotFound(intent.to_string()))
    }

    /// Returns every workflow in registration order.
    pub fn all(&self) -> Vec<&Workflow> {
        self.order
            .iter()
            .filter_map(|intent| self.workflows.get(intent))
            .collect()
    }

    /// Returns the on-disk location of a workflow, if known.
    pub fn path(&self, intent: &str) -> Option<&Path> {
        self.paths.get(intent).map(PathBuf::as_path)
    }

    /// Stores or replaces a workflow after validating it.
    ///
    /// A replaced workflow keeps its original registration position. The
    /// source path is recorded when given and kept otherwise.
    pub fn upsert(&mut self, workflow: Workflow, path: Option<PathBuf>) -> Result<(), RegistryError> {
        if workflow.intent.is_empty() {
            return Err(RegistryError::MissingIntent);
        }
        validate_workflow(&workflow)?;

        let intent = workflow.intent.clone();
        if self.workflows.insert(intent.clone(), workflow).is_none() {
            self.order.push(intent.clone());
        }
        if let Some(path) = path {
            self.paths.insert(intent.clone(), path);
        }

        debug!("Registered workflow '{}'", intent);
        Ok(())
    }

    /// Removes a workflow, returning it if it was registered.
    pub fn remove(&mut self, intent: &str) -> Option<Workflow> {
        self.paths.remove(intent);
        self.order.retain(|i| i != intent);
        self.workflows.remove(intent)
    }

    /// Validates, writes and registers a workflow under `dir`.
    pub fn save(&mut self, dir: impl AsRef<Path>, workflow: Workflow) -> Result<PathBuf, RegistryError> {
        let path = save_workflow(dir, &workflow)?;
        self.upsert(workflow, Some(path.clone()))?;
        Ok(path)
    }

    /// Picks the workflow whose keywords best match `text`.
    ///
    /// Each keyword found as a case-insensitive substring scores one point.
    /// The highest score wins, ties go to the first registered workflow, and
    /// [`DEFAULT_INTENT`] is returned when nothing scores.
    pub fn detect_intent(&self, text: &str) -> String {
        let text = text.to_lowercase();
        let mut best: Option<(&str, usize)> = None;

        for workflow in self.all() {
            let score = workflow
                .keywords
                .iter()
                .filter(|kw| !kw.is_empty() && text.contains(&kw.to_lowercase()))
                .count();

            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((workflow.intent.as_str(), score));
            }
        }

        match best {
            Some((intent, score)) => {
                debug!("Detected intent '{}' (score {})", intent, score);
                intent.to_string()
            }
            None => DEFAULT_INTENT.to_string(),
        }
    }

    /// Registered intents in registration order.
    pub fn intents(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    fn seed_defaults(&mut self) {
        for workflow in default_workflows() {
            let intent = workflow.intent.clone();
            if let Err(e) = self.upsert(workflow, None) {
                warn!("Built-in workflow '{}' rejected: {}", intent, e);
            }
        }
    }
}

/// Writes a workflow to `<dir>/<sanitized intent>.json`, returning the path.
pub fn save_workflow(dir: impl AsRef<Path>, workflow: &Workflow) -> Result<PathBuf, RegistryError> {
    if workflow.intent.is_empty() {
        return Err(RegistryError::MissingIntent);
    }
    validate_workflow(workflow)?;

    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("{}.json", sanitize_intent(&workflow.intent)));
    save_workflow_to_path(&path, workflow)?;
    Ok(path)
}

/// Writes a workflow as pretty-printed JSON with a trailing newline.
pub fn save_workflow_to_path(path: impl AsRef<Path>, workflow: &Workflow) -> Result<(), RegistryError> {
    validate_workflow(workflow)?;

    let path = path.as_ref();
    let mut data = serde_json::to_string_pretty(workflow)?;
    data.push('\n');

    fs::write(path, data).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Saved workflow '{}' to {}", workflow.intent, path.display());
    Ok(())
}

/// Derives a safe file stem from an intent.
///
/// Keeps ASCII letters (lowercased), digits, `-` and `_`; spaces become `_`;
/// everything else is dropped. An empty result becomes `workflow`.
pub fn sanitize_intent(intent: &str) -> String {
    let stem: String = intent
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            ' ' => Some('_'),
            _ => None,
        })
        .collect();

    if stem.is_empty() {
        "workflow".to_string()
    } else {
        stem
    }
}

/// Recursively collects workflow files, sorted by path.
fn collect_workflow_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read workflow directory '{}': {}", dir.display(), e);
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            collect_workflow_files(&path, files);
        } else if is_workflow_file(&path) {
            files.push(path);
        }
    }
}

fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("yaml") | Some("yml")
    )
}

fn read_workflow_file(path: &Path) -> Result<Workflow, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("read failed: {}", e))?;

    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| format!("invalid JSON: {}", e))?,
        _ => serde_yaml::from_str(&content).map_err(|e| format!("invalid YAML: {}", e))?,
    };

    serde_json::from_value(value).map_err(|e| format!("not a workflow: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{PublishMode, Step, ToolRef};
    use crate::workflow::store::MemoryWorkflowStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_workflow() -> Workflow {
        let mut workflow = Workflow::from_steps(
            "Web Research!",
            vec![
                Step::new("s1", "Search").with_tool(
                    ToolRef::new("web_search")
                        .with_arg("query", "${A.query}")
                        .with_arg("max_results", 5),
                ),
                Step::new("s2", "Fetch")
                    .with_guard("A.first_url")
                    .with_tool(ToolRef::new("web_fetch").with_arg("url", "${A.first_url}"))
                    .depends_on("s1")
                    .with_timeout("30s")
                    .publish(PublishMode::Topo),
            ],
        )
        .with_description("Search and fetch")
        .with_keywords(&["web", "search"])
        .with_max_concurrency(2);
        workflow.ui = Some(json!({"layout": {"s1": {"x": 10, "y": 20}}}));
        workflow.fail_fast = Some(true);
        workflow
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = tempdir().unwrap();
        let workflow = sample_workflow();

        let path = save_workflow(temp_dir.path(), &workflow).unwrap();
        assert_eq!(path.file_name().unwrap(), "web_research.json");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("}\n"));
        assert!(content.contains("\n  \"intent\""));

        let registry = Registry::load_from_dir(temp_dir.path());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("Web Research!").unwrap(), &workflow);
        assert_eq!(registry.path("Web Research!"), Some(path.as_path()));
    }

    #[test]
    fn test_load_skips_invalid_files() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("nested");
        fs::create_dir_all(&nested).unwrap();

        fs::write(temp_dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(
            temp_dir.path().join("cycle.json"),
            r#"{"intent":"cycle","steps":[{"id":"a","depends_on":["b"]},{"id":"b","depends_on":["a"]}]}"#,
        )
        .unwrap();
        fs::write(temp_dir.path().join("nointent.json"), r#"{"steps":[]}"#).unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(
            nested.join("good.yaml"),
            "intent: good\nkeywords: [ok]\nsteps:\n  - id: s1\n    text: noop\n",
        )
        .unwrap();

        let registry = Registry::load_from_dir(temp_dir.path());
        assert_eq!(registry.intents(), &["good".to_string()]);
        assert!(registry.get("cycle").is_err());
    }

    #[test]
    fn test_missing_dir_seeds_defaults() {
        let registry = Registry::load_from_dir("/nonexistent/workflows/dir");
        assert!(registry.get("deep_web_report").is_ok());
        assert!(registry.get(DEFAULT_INTENT).is_ok());
        assert!(registry.path(DEFAULT_INTENT).is_none());
    }

    #[test]
    fn test_upsert_validates() {
        let mut registry = Registry::new();

        let invalid = Workflow::from_steps("bad", vec![Step::new("a", "a").depends_on("ghost")]);
        assert!(matches!(
            registry.upsert(invalid, None),
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            registry.upsert(Workflow::new(""), None),
            Err(RegistryError::MissingIntent)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upsert_keeps_order_and_remove() {
        let mut registry = Registry::new();
        registry.upsert(Workflow::new("one"), None).unwrap();
        registry.upsert(Workflow::new("two"), None).unwrap();
        registry
            .upsert(Workflow::new("one").with_description("v2"), Some(PathBuf::from("one.json")))
            .unwrap();

        assert_eq!(registry.intents(), &["one".to_string(), "two".to_string()]);
        assert_eq!(registry.get("one").unwrap().description, "v2");
        assert_eq!(registry.path("one"), Some(Path::new("one.json")));

        assert!(registry.remove("one").is_some());
        assert!(registry.remove("one").is_none());
        assert!(registry.path("one").is_none());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_registry_save() {
        let temp_dir = tempdir().unwrap();
        let mut registry = Registry::new();

        let path = registry.save(temp_dir.path(), sample_workflow()).unwrap();
        assert!(path.exists());
        assert_eq!(registry.path("Web Research!"), Some(path.as_path()));

        let invalid = Workflow::from_steps("dup", vec![Step::new("a", "1"), Step::new("a", "2")]);
        assert!(registry.save(temp_dir.path(), invalid).is_err());
        assert!(!temp_dir.path().join("dup.json").exists());
        assert!(registry.get("dup").is_err());
    }

    #[test]
    fn test_detect_intent() {
        let mut registry = Registry::new();
        registry
            .upsert(Workflow::new("first").with_keywords(&["report", "web"]), None)
            .unwrap();
        registry
            .upsert(Workflow::new("second").with_keywords(&["web", "report"]), None)
            .unwrap();
        registry
            .upsert(Workflow::new("third").with_keywords(&["echo", "say", "print"]), None)
            .unwrap();

        assert_eq!(registry.detect_intent("Please SAY and print this"), "third");
        assert_eq!(registry.detect_intent("a web report"), "first");
        assert_eq!(registry.detect_intent("nothing matches"), DEFAULT_INTENT);
    }

    #[test]
    fn test_detect_intent_defaults() {
        let registry = Registry::with_defaults();
        assert_eq!(registry.detect_intent("write a deep research report"), "deep_web_report");
        assert_eq!(registry.detect_intent("echo hello"), "cli_echo");
    }

    #[test]
    fn test_sanitize_intent() {
        assert_eq!(sanitize_intent("Web Research!"), "web_research");
        assert_eq!(sanitize_intent("a-b_c9"), "a-b_c9");
        assert_eq!(sanitize_intent("!!!"), "workflow");
    }

    #[test]
    fn test_save_requires_intent() {
        let temp_dir = tempdir().unwrap();
        let result = save_workflow(temp_dir.path(), &Workflow::new(""));
        assert!(matches!(result, Err(RegistryError::MissingIntent)));
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = MemoryWorkflowStore::new();
        store
            .put(json!({"intent": "stored", "keywords": ["db"], "steps": [{"id": "s1"}]}))
            .await;
        store
            .put(json!({"intent": "broken", "steps": [{"id": "x"}, {"id": "x"}]}))
            .await;
        store.put(json!({"intent": 42})).await;

        let registry = Registry::load_from_store(Some(&store as &dyn WorkflowStore)).await.unwrap();
        assert_eq!(registry.intents(), &["stored".to_string()]);
    }

    #[tokio::test]
    async fn test_load_from_store_empty_seeds_defaults() {
        let registry = Registry::load_from_store(None).await.unwrap();
        assert_eq!(registry.len(), 2);

        let store = MemoryWorkflowStore::new();
        let registry = Registry::load_from_store(Some(&store as &dyn WorkflowStore)).await.unwrap();
        assert!(registry.get(DEFAULT_INTENT).is_ok());
    }
}
