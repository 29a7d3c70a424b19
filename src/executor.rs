use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use rayon::ThreadPool;
use serde::Serialize;
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::change::ChangeDetector;
use crate::error::{TaskFailure, TsumikiError};
use crate::fingerprint::{FingerprintSnapshot, SnapshotStore};
use crate::graph::{PhaseBucket, TaskGraph};
use crate::options::{AbortHandle, FailurePolicy, Options};
use crate::phase::TaskPhase;
use crate::task::{TaskContext, TaskDescriptor};
use crate::{matcher, sandbox};

/// Lifecycle of a task within a single build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    /// Every prerequisite reached a terminal state.
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    #[serde(skip)]
    pub start: Instant,
    pub duration: Duration,
}

/// Terminal state of a task plus whatever is known about how it got there.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub phase: TaskPhase,
    pub state: TaskState,
    pub failure: Option<TaskFailure>,
    pub skip_reason: Option<String>,
    pub execution: Option<TaskExecution>,
    /// Nothing changed since the last successful run, the task was not invoked.
    pub up_to_date: bool,
    /// The task was given change information from a previous run.
    pub incremental: bool,
}

impl TaskOutcome {
    fn skipped(phase: &TaskPhase, reason: impl Into<String>) -> Self {
        Self {
            phase: phase.clone(),
            state: TaskState::Skipped,
            failure: None,
            skip_reason: Some(reason.into()),
            execution: None,
            up_to_date: false,
            incremental: false,
        }
    }
}

/// The outcome of every task of a build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildResult {
    pub tasks: BTreeMap<String, TaskOutcome>,
    /// The build was stopped early, by the abort policy or externally.
    pub aborted: bool,
}

impl BuildResult {
    pub fn state(&self, task: &str) -> Option<TaskState> {
        self.tasks.get(task).map(|outcome| outcome.state)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskFailure> {
        self.tasks
            .values()
            .filter_map(|outcome| outcome.failure.as_ref())
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tasks
            .values()
            .filter(|outcome| outcome.state == state)
            .count()
    }

    pub fn is_success(&self) -> bool {
        !self.aborted && self.count(TaskState::Failed) == 0
    }

    /// Process exit status a command line front end should use.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// What a worker reports back to the scheduler.
enum Completion {
    /// The build was aborted before the task could start.
    Aborted,
    Finished {
        result: Result<Run, TaskFailure>,
        execution: TaskExecution,
    },
}

enum Run {
    Executed { incremental: bool },
    UpToDate,
}

/// Runs a [`TaskGraph`] phase by phase on a bounded worker pool.
///
/// Within a phase, a task starts as soon as all of its declared
/// prerequisites have finished. The next phase is only admitted once every
/// task of the current one has reached a terminal state.
pub struct Executor {
    options: Options,
}

impl Executor {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn run(
        &self,
        graph: &TaskGraph,
        store: &dyn SnapshotStore,
    ) -> Result<BuildResult, TsumikiError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|i| format!("tsumiki-worker-{i}"))
            .build()?;

        let root_span = tracing::span!(Level::INFO, "build");
        root_span.pb_set_length(graph.len() as u64);
        root_span.pb_set_style(&crate::utils::get_style_build()?);
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let halt = AbortHandle::new();
        let style = crate::utils::get_style_task()?;

        let scheduler = Scheduler {
            executor: self,
            graph,
            store,
            pool: &pool,
            halt: &halt,
            style: &style,
            states: vec![TaskState::Pending; graph.len()],
            outcomes: HashMap::new(),
            progress: root_span.clone(),
        };

        let (outcomes, aborted) = scheduler.run();

        let mut result = BuildResult {
            tasks: BTreeMap::new(),
            aborted,
        };

        for bucket in graph.phases() {
            for &index in &bucket.tasks {
                let task = graph.task(index);
                let outcome = outcomes
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| TaskOutcome::skipped(task.phase(), "never scheduled"));
                result.tasks.insert(task.name().to_string(), outcome);
            }
        }

        tracing::info!(
            "Build finished: {} succeeded, {} failed, {} skipped",
            result.count(TaskState::Succeeded),
            result.count(TaskState::Failed),
            result.count(TaskState::Skipped),
        );

        Ok(result)
    }

    fn stopping(&self, halt: &AbortHandle) -> bool {
        halt.is_aborted() || self.options.abort.is_aborted()
    }

    /// Worker side of a single task.
    fn execute(
        &self,
        task: &TaskDescriptor,
        store: &dyn SnapshotStore,
        halt: &AbortHandle,
        parent: &Span,
        style: &ProgressStyle,
    ) -> Completion {
        let span = tracing::span!(parent: parent, Level::INFO, "task", name = task.name());
        span.pb_set_style(style);
        span.pb_set_message(&format!("Running {}", task.name()));
        let _enter = span.enter();

        // Last safe point before task code runs.
        if self.stopping(halt) {
            return Completion::Aborted;
        }

        let start = Instant::now();
        // Snapshot stores are user code too, a panic in one must still
        // produce a completion.
        let result = sandbox::catch(|| self.attempt(task, store, &span)).unwrap_or_else(|panic| {
            Err(TaskFailure::unexpected(
                task,
                format!("Engine panicked while running the task: {}", panic.message),
                panic.detail,
            ))
        });
        let execution = TaskExecution {
            start,
            duration: start.elapsed(),
        };

        // Raised here rather than by the scheduler, so this worker cannot pick
        // up another task before the flag is visible.
        if result.is_err() && self.options.policy == FailurePolicy::Abort {
            halt.abort();
        }

        Completion::Finished { result, execution }
    }

    fn attempt(
        &self,
        task: &TaskDescriptor,
        store: &dyn SnapshotStore,
        span: &Span,
    ) -> Result<Run, TaskFailure> {
        let root = self.options.get_root();

        let previous = store
            .load(task.name())
            .map_err(|e| TaskFailure::io(task, "Couldn't read fingerprints", e))?;

        let detection = ChangeDetector::new(root)
            .detect(task, previous.as_ref())
            .map_err(|e| TaskFailure::io(task, "Couldn't resolve inputs and outputs", e))?;

        tracing::debug!(
            inputs = detection.inputs.len(),
            outputs = detection.outputs.len(),
            input_changes = detection.changes.input_changes.len(),
            output_changes = detection.changes.output_changes.len(),
            incremental = detection.incremental,
            "computed change set"
        );

        let declares_files = !task.inputs().is_empty() || !task.outputs().is_empty();
        if detection.incremental && declares_files && detection.changes.is_empty() {
            return Ok(Run::UpToDate);
        }

        let incremental = detection.incremental;
        let context = TaskContext::new(&self.options.args, root, detection, span.clone());
        sandbox::invoke(task, &context)?;
        drop(context);

        // Captured after the task returned, so its own writes are included.
        let capture = || -> std::io::Result<FingerprintSnapshot> {
            let inputs = matcher::resolve_all(task.inputs(), root)?;
            let outputs = matcher::resolve_all(task.outputs(), root)?;
            FingerprintSnapshot::capture(&inputs, &outputs)
        };

        let snapshot = capture().map_err(|e| TaskFailure::io(task, "Couldn't capture fingerprints", e))?;

        store
            .replace(task.name(), &snapshot)
            .map_err(|e| TaskFailure::io(task, "Couldn't write fingerprints", e))?;

        Ok(Run::Executed { incremental })
    }
}

/// Mutable state of a single build, owned by the coordinating thread.
struct Scheduler<'a> {
    executor: &'a Executor,
    graph: &'a TaskGraph,
    store: &'a dyn SnapshotStore,
    pool: &'a ThreadPool,
    /// Raised by the abort policy, separate from the user's handle.
    halt: &'a AbortHandle,
    style: &'a ProgressStyle,
    states: Vec<TaskState>,
    outcomes: HashMap<NodeIndex, TaskOutcome>,
    progress: Span,
}

impl Scheduler<'_> {
    fn run(mut self) -> (HashMap<NodeIndex, TaskOutcome>, bool) {
        let graph = self.graph;
        for bucket in graph.phases() {
            // Phase boundary is a safe point.
            if self.executor.stopping(self.halt) {
                for &index in &bucket.tasks {
                    let phase = graph.task(index).phase();
                    self.settle(index, TaskOutcome::skipped(phase, "build aborted"));
                }
                continue;
            }

            let span = tracing::span!(Level::INFO, "phase", name = %bucket);
            let _enter = span.enter();
            tracing::debug!("entering phase {} with {} task(s)", bucket, bucket.tasks.len());

            self.run_phase(bucket, &span);
        }

        let aborted = self.executor.stopping(self.halt);
        (self.outcomes, aborted)
    }

    /// This function executes the tasks of one phase using the thread pool.
    ///
    /// The algorithm works as follows:
    /// 1. Count, for every task, how many of its declared prerequisites are
    ///    part of this phase.
    /// 2. Tasks with a count of zero are ready. A ready task is either
    ///    skipped right away, or sent to the pool.
    /// 3. Workers report back over a channel. When a task settles, the
    ///    counts of its dependents are decremented, and tasks reaching zero
    ///    become ready.
    /// 4. The loop ends when nothing is ready and nothing is running.
    fn run_phase(&mut self, bucket: &PhaseBucket, phase_span: &Span) {
        let members: HashSet<NodeIndex> = bucket.tasks.iter().copied().collect();

        let mut waiting: HashMap<NodeIndex, usize> = bucket
            .tasks
            .iter()
            .map(|&index| {
                let count = self
                    .graph
                    .prerequisites(index)
                    .into_iter()
                    .filter(|dep| members.contains(dep))
                    .count();
                (index, count)
            })
            .collect();

        let mut ready: VecDeque<NodeIndex> = bucket
            .tasks
            .iter()
            .copied()
            .filter(|index| waiting[index] == 0)
            .collect();

        let pool = self.pool;
        let executor = self.executor;
        let store = self.store;
        let graph = self.graph;

        pool.in_place_scope(|s| {
            let (result_sender, result_receiver) = channel::<(NodeIndex, Completion)>();
            let mut running = 0usize;

            loop {
                while let Some(index) = ready.pop_front() {
                    self.states[index.index()] = TaskState::Ready;
                    let task = graph.task(index);

                    if let Some(reason) = self.skip_reason(index) {
                        tracing::warn!("Skipping task '{}': {}", task.name(), reason);
                        self.settle(index, TaskOutcome::skipped(task.phase(), reason));
                        release(graph, index, &members, &mut waiting, &mut ready);
                        continue;
                    }

                    self.states[index.index()] = TaskState::Running;
                    running += 1;

                    let task = Arc::clone(task);
                    let sender = result_sender.clone();
                    let halt = self.halt;
                    let style = self.style;
                    let parent = phase_span.clone();

                    s.spawn(move |_| {
                        let completion = executor.execute(&task, store, halt, &parent, style);
                        // The receiver outlives every worker of this scope.
                        let _ = sender.send((index, completion));
                    });
                }

                if running == 0 {
                    break;
                }

                let Ok((index, completion)) = result_receiver.recv() else {
                    break;
                };
                running -= 1;

                let outcome = self.complete(index, completion);
                self.settle(index, outcome);
                release(graph, index, &members, &mut waiting, &mut ready);
            }
        });
    }

    fn skip_reason(&self, index: NodeIndex) -> Option<String> {
        if self.executor.stopping(self.halt) {
            return Some("build aborted".to_string());
        }

        self.graph
            .prerequisites(index)
            .into_iter()
            .find(|dep| {
                matches!(
                    self.states[dep.index()],
                    TaskState::Failed | TaskState::Skipped
                )
            })
            .map(|dep| {
                format!(
                    "prerequisite '{}' did not succeed",
                    self.graph.task(dep).name()
                )
            })
    }

    fn complete(&self, index: NodeIndex, completion: Completion) -> TaskOutcome {
        let task = self.graph.task(index);

        let (result, execution) = match completion {
            Completion::Aborted => return TaskOutcome::skipped(task.phase(), "build aborted"),
            Completion::Finished { result, execution } => (result, execution),
        };

        match result {
            Ok(run) => {
                let (up_to_date, incremental) = match run {
                    Run::UpToDate => {
                        tracing::info!("Task '{}' is up to date", task.name());
                        (true, true)
                    }
                    Run::Executed { incremental } => {
                        tracing::info!(
                            "Task '{}' succeeded in {:.2?}",
                            task.name(),
                            execution.duration
                        );
                        (false, incremental)
                    }
                };

                TaskOutcome {
                    phase: task.phase().clone(),
                    state: TaskState::Succeeded,
                    failure: None,
                    skip_reason: None,
                    execution: Some(execution),
                    up_to_date,
                    incremental,
                }
            }
            Err(failure) => {
                tracing::error!("{}", failure);

                TaskOutcome {
                    phase: task.phase().clone(),
                    state: TaskState::Failed,
                    failure: Some(failure),
                    skip_reason: None,
                    execution: Some(execution),
                    up_to_date: false,
                    incremental: false,
                }
            }
        }
    }

    fn settle(&mut self, index: NodeIndex, outcome: TaskOutcome) {
        self.states[index.index()] = outcome.state;
        self.outcomes.insert(index, outcome);
        self.progress.pb_inc(1);
    }
}

/// Decrements the counts of the in-phase dependents of a settled task,
/// queueing those that have nothing left to wait for.
fn release(
    graph: &TaskGraph,
    index: NodeIndex,
    members: &HashSet<NodeIndex>,
    waiting: &mut HashMap<NodeIndex, usize>,
    ready: &mut VecDeque<NodeIndex>,
) {
    for dependent in graph.dependents(index) {
        if !members.contains(&dependent) {
            continue;
        }

        if let Some(count) = waiting.get_mut(&dependent) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent);
            }
        }
    }
}
