use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::change::{ChangeSet, Detection};
use crate::phase::TaskPhase;

/// The single capability every task implementation provides.
///
/// A task is handed a [`TaskContext`] describing its resolved inputs and
/// outputs and what changed since its last successful run. What it does with
/// them is entirely up to the implementation.
///
/// To fail without being treated as a defect, return a
/// [`TaskError`](crate::TaskError) (or an [`std::io::Error`]) somewhere in the
/// error chain. Any other error, and any panic, is reported as an unexpected
/// failure with full detail.
///
/// Functions and closures with the matching signature are tasks too:
///
/// ```rust
/// use tsumiki::{Task, TaskContext};
///
/// fn report(ctx: &TaskContext<'_>) -> anyhow::Result<()> {
///     for input in ctx.changed_inputs() {
///         println!("{input} changed");
///     }
///     Ok(())
/// }
///
/// fn assert_task(_: &impl Task) {}
/// assert_task(&report);
/// ```
pub trait Task: Send + Sync {
    fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()>;
}

impl<F> Task for F
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Immutable description of a registered task.
///
/// Descriptors are created by the [`Registry`](crate::Registry) and shared
/// behind an [`Arc`] for the rest of the build session.
#[derive(Clone)]
pub struct TaskDescriptor {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) phase: TaskPhase,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) dependents: BTreeSet<String>,
    pub(crate) task: Arc<dyn Task>,
}

impl TaskDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn phase(&self) -> &TaskPhase {
        &self.phase
    }

    /// Declared input paths and patterns, in declaration order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Declared output paths and patterns, in declaration order.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Tasks which may only start after this one has completed.
    pub fn dependents(&self) -> &BTreeSet<String> {
        &self.dependents
    }

    pub(crate) fn task(&self) -> &dyn Task {
        self.task.as_ref()
    }
}

impl Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("phase", &self.phase)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dependents", &self.dependents)
            .finish_non_exhaustive()
    }
}

/// The context passed to a single task invocation.
///
/// It is built right before the task runs and discarded as soon as it
/// returns.
pub struct TaskContext<'a> {
    args: &'a [String],
    root: &'a Utf8Path,
    inputs: BTreeSet<Utf8PathBuf>,
    outputs: BTreeSet<Utf8PathBuf>,
    changed_inputs: BTreeSet<Utf8PathBuf>,
    changed_outputs: BTreeSet<Utf8PathBuf>,
    changes: Option<ChangeSet>,
    /// Tracing span assigned to this task.
    pub(crate) span: tracing::Span,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        args: &'a [String],
        root: &'a Utf8Path,
        detection: Detection,
        span: tracing::Span,
    ) -> Self {
        let Detection {
            inputs,
            outputs,
            changes,
            incremental,
        } = detection;

        let changed_inputs = changes.changed_inputs().map(Utf8Path::to_path_buf).collect();
        let changed_outputs = changes.changed_outputs().map(Utf8Path::to_path_buf).collect();

        Self {
            args,
            root,
            inputs,
            outputs,
            changed_inputs,
            changed_outputs,
            changes: incremental.then_some(changes),
            span,
        }
    }

    /// Arguments given to the build by the user.
    pub fn args(&self) -> &[String] {
        self.args
    }

    /// The directory the input and output specs are relative to.
    pub fn root(&self) -> &Utf8Path {
        self.root
    }

    /// Every entity matching the declared inputs.
    pub fn all_inputs(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.inputs
    }

    /// Every entity matching the declared outputs.
    pub fn all_outputs(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.outputs
    }

    /// Inputs added or modified since the last successful run. On a first
    /// run, and whenever an output changed, this is every input.
    pub fn changed_inputs(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.changed_inputs
    }

    /// Outputs added or modified since the last successful run.
    pub fn changed_outputs(&self) -> &BTreeSet<Utf8PathBuf> {
        &self.changed_outputs
    }

    /// Inputs which existed during the last successful run but are gone now.
    pub fn deleted_inputs(&self) -> impl Iterator<Item = &Utf8Path> {
        self.changes.iter().flat_map(ChangeSet::deleted_inputs)
    }

    /// Outputs which existed during the last successful run but are gone now.
    pub fn deleted_outputs(&self) -> impl Iterator<Item = &Utf8Path> {
        self.changes.iter().flat_map(ChangeSet::deleted_outputs)
    }

    /// The raw change records, `None` when no incremental information is
    /// available and the task should do a full run.
    pub fn changes(&self) -> Option<&ChangeSet> {
        self.changes.as_ref()
    }

    pub fn is_incremental(&self) -> bool {
        self.changes.is_some()
    }

    /// Tracing span of this invocation, for tasks that want to log under it.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}
