//! Workflow Execution Engine
//!
//! The core engine that runs a workflow against an attribute bag:
//! - Sequential execution for workflows without dependency edges
//! - Concurrent DAG scheduling with an optional concurrency cap
//! - Deterministic attribute merging independent of completion order
//! - Fail-fast cancellation and best-effort result publication

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::blackboard::{Blackboard, Precedence};
use super::dispatch::{StepPublisher, ToolDispatcher};
use super::step::{run_step, StepFailure, StepOutput};
use super::trace::{StepStatus, StepTrace};
use crate::attrs::Attrs;
use crate::error::{ExecutionError, RunFailure};
use crate::guard::eval_guard;
use crate::workflow::validator::topological_order;
use crate::workflow::{preprocess_workflow, PublishMode, Step, Workflow};

/// How a single step ended.
#[derive(Debug)]
enum Outcome {
    Completed(StepOutput),
    Skipped,
    Noop,
    Failed(StepFailure),
}

/// Everything a worker needs besides the step and its snapshot.
#[derive(Clone)]
struct StepContext {
    dispatcher: Arc<dyn ToolDispatcher>,
    allowed: Arc<HashSet<String>>,
    cancel: CancellationToken,
}

/// Workflow execution engine.
///
/// Tools are reached only through the [`ToolDispatcher`]; results flagged
/// with `publish_result` go to the optional [`StepPublisher`].
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::HashSet;
/// use std::sync::Arc;
///
/// use warpp::execution::{DryRunDispatcher, Engine};
/// use warpp::workflow::{Step, ToolRef, Workflow};
/// use warpp::Attrs;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = Workflow::from_steps(
///         "demo",
///         vec![Step::new("s1", "Echo").with_tool(ToolRef::new("run_cli"))],
///     );
///     let allowed: HashSet<String> = workflow.tool_names().into_iter().collect();
///
///     let engine = Engine::new(Arc::new(DryRunDispatcher));
///     let mut attrs = Attrs::new();
///     let summary = engine.execute(&workflow, &allowed, &mut attrs).await?;
///     println!("{}", summary);
///     Ok(())
/// }
/// ```
pub struct Engine {
    dispatcher: Arc<dyn ToolDispatcher>,
    publisher: Option<Arc<dyn StepPublisher>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Creates an engine dispatching through `dispatcher`.
    pub fn new(dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        Self {
            dispatcher,
            publisher: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the consumer of published step results.
    pub fn set_publisher(&mut self, publisher: Arc<dyn StepPublisher>) {
        self.publisher = Some(publisher);
    }

    /// Sets the parent cancellation token; cancelling it aborts running workflows.
    pub fn set_cancel_token(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Executes the workflow and returns its summary.
    ///
    /// `attrs` is updated in place with the run's final attributes, also when
    /// the run fails.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        allowed: &HashSet<String>,
        attrs: &mut Attrs,
    ) -> Result<String, ExecutionError> {
        self.run(workflow, allowed, attrs, false)
            .await
            .map(|(summary, _)| summary)
            .map_err(|failure| failure.error)
    }

    /// Executes the workflow and also returns a trace entry per finished step.
    ///
    /// On a fatal error the trace collected so far is carried in the
    /// [`RunFailure`].
    pub async fn execute_with_trace(
        &self,
        workflow: &Workflow,
        allowed: &HashSet<String>,
        attrs: &mut Attrs,
    ) -> Result<(String, Vec<StepTrace>), RunFailure> {
        self.run(workflow, allowed, attrs, true).await
    }

    async fn run(
        &self,
        workflow: &Workflow,
        allowed: &HashSet<String>,
        attrs: &mut Attrs,
        tracing: bool,
    ) -> Result<(String, Vec<StepTrace>), RunFailure> {
        let workflow = preprocess_workflow(workflow);
        let run_cancel = self.cancel.child_token();
        let ctx = StepContext {
            dispatcher: Arc::clone(&self.dispatcher),
            allowed: Arc::new(allowed.clone()),
            cancel: run_cancel.clone(),
        };

        let mut state = RunState::new(std::mem::take(attrs), tracing);

        info!(
            "Executing intent '{}' ({} steps, {} mode)",
            workflow.intent,
            workflow.steps.len(),
            if workflow.has_dependencies() { "dag" } else { "sequential" }
        );

        let result = if workflow.has_dependencies() {
            self.run_dag(&workflow, &ctx, &mut state).await
        } else {
            self.run_sequential(&workflow, &ctx, &mut state).await
        };

        if result.is_ok() {
            state.flush_topo(self.publisher.as_deref(), &run_cancel).await;
        }
        run_cancel.cancel();

        let summary = state.summary(&workflow.intent);
        let (final_attrs, trace) = state.finish();
        *attrs = final_attrs;

        match result {
            Ok(()) => {
                info!("Intent '{}' finished", workflow.intent);
                Ok((summary, trace))
            }
            Err(error) => {
                error!("Intent '{}' aborted: {}", workflow.intent, error);
                Err(RunFailure { error, trace })
            }
        }
    }

    /// Runs steps strictly in declaration order.
    async fn run_sequential(
        &self,
        workflow: &Workflow,
        ctx: &StepContext,
        state: &mut RunState,
    ) -> Result<(), ExecutionError> {
        for (idx, step) in workflow.steps.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let outcome = execute_node(ctx, step, state.board.attrs()).await;
            state
                .settle(self.publisher.as_deref(), &ctx.cancel, step, (idx, idx), outcome, false)
                .await?;
        }
        Ok(())
    }

    /// Runs the dependency graph with spawned workers.
    async fn run_dag(
        &self,
        workflow: &Workflow,
        ctx: &StepContext,
        state: &mut RunState,
    ) -> Result<(), ExecutionError> {
        let graph = Graph::build(workflow)?;
        let total = workflow.steps.len();
        let limit = workflow.concurrency_limit();

        let mut in_degree = graph.in_degree.clone();
        let mut ready: Vec<usize> = (0..total).filter(|&i| in_degree[i] == 0).collect();
        let mut workers: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut finished = 0;
        let mut fatal: Option<ExecutionError> = None;

        debug!("DAG run: {} steps, concurrency limit {}", total, limit);

        loop {
            if fatal.is_none() && ctx.cancel.is_cancelled() {
                fatal = Some(ExecutionError::Cancelled);
            }

            if fatal.is_none() {
                while !ready.is_empty() && (limit == 0 || workers.len() < limit) {
                    let idx = ready.remove(0);
                    let step = workflow.steps[idx].clone();
                    let snapshot = state.board.snapshot(&graph.ancestors[idx]);
                    let worker_ctx = ctx.clone();

                    debug!("Admitting step '{}'", step.id);
                    workers.spawn(async move {
                        let outcome = execute_node(&worker_ctx, &step, &snapshot).await;
                        (idx, outcome)
                    });
                }
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };

            let (idx, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    if fatal.is_none() {
                        ctx.cancel.cancel();
                        fatal = Some(worker_failure(e));
                    }
                    continue;
                }
            };
            finished += 1;

            let step = &workflow.steps[idx];
            if fatal.is_some() {
                debug!("Discarding result of step '{}' after abort", step.id);
                continue;
            }

            let precedence = (graph.rank[idx], idx);
            if let Err(e) = state
                .settle(self.publisher.as_deref(), &ctx.cancel, step, precedence, outcome, true)
                .await
            {
                ctx.cancel.cancel();
                fatal = Some(e);
                continue;
            }

            for &next in &graph.dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(next);
                }
            }
            ready.sort_unstable();
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if finished < total {
            warn!("{} step(s) never became ready", total - finished);
        }
        Ok(())
    }
}

/// Static dependency structure of a workflow.
struct Graph {
    in_degree: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    /// Longest dependency chain leading to each step
    rank: Vec<usize>,
    /// Transitive dependencies of each step, by id
    ancestors: Vec<HashSet<String>>,
}

impl Graph {
    fn build(workflow: &Workflow) -> Result<Self, ExecutionError> {
        let order = topological_order(workflow)?;
        let n = workflow.steps.len();

        let index: HashMap<&str, usize> = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, step) in workflow.steps.iter().enumerate() {
            for dep in &step.depends_on {
                match index.get(dep.as_str()) {
                    Some(&d) => {
                        in_degree[i] += 1;
                        dependents[d].push(i);
                        deps[i].push(d);
                    }
                    None => warn!("Step '{}' depends on unknown step '{}'", step.id, dep),
                }
            }
        }

        let mut rank = vec![0usize; n];
        let mut ancestors: Vec<HashSet<String>> = vec![HashSet::new(); n];
        for &i in &order {
            let mut closure = HashSet::new();
            for &d in &deps[i] {
                rank[i] = rank[i].max(rank[d] + 1);
                closure.insert(workflow.steps[d].id.clone());
                closure.extend(ancestors[d].iter().cloned());
            }
            ancestors[i] = closure;
        }

        Ok(Self {
            in_degree,
            dependents,
            rank,
            ancestors,
        })
    }
}

/// Runs one step against its snapshot: guard, no-op check, allow-list, dispatch.
async fn execute_node(ctx: &StepContext, step: &Step, attrs: &Attrs) -> Outcome {
    if !step.guard.is_empty() && !eval_guard(&step.guard, attrs) {
        debug!("Step '{}' skipped (guard: {})", step.id, step.guard);
        return Outcome::Skipped;
    }

    let Some(tool) = step.tool.as_ref() else {
        return Outcome::Noop;
    };

    if !ctx.allowed.contains(&tool.name) {
        return Outcome::Failed(StepFailure::new(ExecutionError::DisallowedTool {
            step: step.id.clone(),
            tool: tool.name.clone(),
        }));
    }

    let call = run_step(ctx.dispatcher.as_ref(), &ctx.cancel, step, tool, attrs);
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(output)) => Outcome::Completed(output),
        Ok(Err(failure)) => Outcome::Failed(failure),
        Err(panic) => Outcome::Failed(StepFailure::new(ExecutionError::Panic {
            step: step.id.clone(),
            message: panic_message(panic.as_ref()),
        })),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_failure(e: JoinError) -> ExecutionError {
    if e.is_cancelled() {
        ExecutionError::Cancelled
    } else {
        ExecutionError::Panic {
            step: "<worker>".to_string(),
            message: e.to_string(),
        }
    }
}

/// Publishes one result; failures and panics are logged, never returned.
async fn publish_safely(
    publisher: &dyn StepPublisher,
    cancel: &CancellationToken,
    step_id: &str,
    payload: &[u8],
) {
    match AssertUnwindSafe(publisher.publish(cancel, step_id, payload))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => debug!("Published result of step '{}'", step_id),
        Ok(Err(e)) => warn!("Step result publish failed (step={}): {}", step_id, e),
        Err(panic) => warn!(
            "Publisher panicked (step={}): {}",
            step_id,
            panic_message(panic.as_ref())
        ),
    }
}

/// Mutable bookkeeping of one run, owned by the control loop.
struct RunState {
    board: Blackboard,
    /// Step texts listed in the summary, in settle order.
    summarized: Vec<String>,
    trace: Vec<StepTrace>,
    tracing: bool,
    topo_buffer: Vec<(Precedence, String, Vec<u8>)>,
}

impl RunState {
    fn new(attrs: Attrs, tracing: bool) -> Self {
        Self {
            board: Blackboard::new(attrs),
            summarized: Vec::new(),
            trace: Vec::new(),
            tracing,
            topo_buffer: Vec::new(),
        }
    }

    /// Applies a step's outcome. Returns the error when it must abort the run.
    ///
    /// With `record_all`, skipped, no-op and soft-failed steps also get a
    /// (delta-free) result record under their id and a summary line.
    async fn settle(
        &mut self,
        publisher: Option<&dyn StepPublisher>,
        cancel: &CancellationToken,
        step: &Step,
        precedence: Precedence,
        outcome: Outcome,
        record_all: bool,
    ) -> Result<(), ExecutionError> {
        match outcome {
            Outcome::Skipped => {
                self.settle_idle(step, precedence, StepStatus::Skipped, record_all);
                Ok(())
            }
            Outcome::Noop => {
                self.settle_idle(step, precedence, StepStatus::Noop, record_all);
                Ok(())
            }
            Outcome::Completed(output) => {
                info!("Step '{}' completed", step.id);
                self.board.apply(
                    &step.id,
                    precedence,
                    output.delta.clone(),
                    &output.payload,
                    Some(&output.args),
                );
                self.summarized.push(step.text.clone());

                if step.publish_result {
                    if let Some(publisher) = publisher {
                        match step.publish_mode {
                            PublishMode::Immediate => {
                                publish_safely(publisher, cancel, &step.id, &output.payload).await
                            }
                            PublishMode::Topo => self.topo_buffer.push((
                                precedence,
                                step.id.clone(),
                                output.payload.clone(),
                            )),
                        }
                    }
                }

                if self.tracing {
                    let mut entry = StepTrace::new(&step.id, &step.text, StepStatus::Completed);
                    entry.rendered_args = Some(output.args);
                    entry.delta = Some(output.delta);
                    entry.payload = Some(String::from_utf8_lossy(&output.payload).into_owned());
                    self.trace.push(entry);
                }
                Ok(())
            }
            Outcome::Failed(failure) => {
                let mut entry = StepTrace::new(&step.id, &step.text, StepStatus::Error);
                entry.error = Some(failure.error.to_string());
                entry.rendered_args = failure.args.clone();
                self.push_trace(entry);

                if step.continue_on_error && failure.error.is_recoverable() {
                    warn!("Step '{}' failed, continuing: {}", step.id, failure.error);
                    if record_all {
                        self.board
                            .apply(&step.id, precedence, Attrs::new(), &[], failure.args.as_ref());
                        self.summarized.push(step.text.clone());
                    }
                    Ok(())
                } else {
                    error!("Step '{}' failed: {}", step.id, failure.error);
                    Err(failure.error)
                }
            }
        }
    }

    /// Settles a step that ran no tool.
    fn settle_idle(&mut self, step: &Step, precedence: Precedence, status: StepStatus, record_all: bool) {
        if record_all {
            self.board.apply(&step.id, precedence, Attrs::new(), &[], None);
            self.summarized.push(step.text.clone());
        }
        self.push_trace(StepTrace::new(&step.id, &step.text, status));
    }

    fn push_trace(&mut self, entry: StepTrace) {
        if self.tracing {
            self.trace.push(entry);
        }
    }

    /// Publishes buffered topo-mode results in (rank, declaration) order.
    async fn flush_topo(&mut self, publisher: Option<&dyn StepPublisher>, cancel: &CancellationToken) {
        let Some(publisher) = publisher else {
            return;
        };
        self.topo_buffer.sort_by_key(|(precedence, _, _)| *precedence);
        for (_, step_id, payload) in self.topo_buffer.drain(..) {
            publish_safely(publisher, cancel, &step_id, &payload).await;
        }
    }

    fn summary(&self, intent: &str) -> String {
        let mut out = format!("WARPP: executing intent {}\n", intent);
        for text in &self.summarized {
            out.push_str(&format!("- {}\n", text));
        }
        out.push_str(&format!("\nObjective complete. (steps={}).\n", self.summarized.len()));
        out
    }

    fn finish(self) -> (Attrs, Vec<StepTrace>) {
        (self.board.into_attrs(), self.trace)
    }
}
