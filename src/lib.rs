#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod change;
mod error;
pub mod executor;
pub mod fingerprint;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;
pub mod matcher;
mod options;
mod phase;
mod registry;
mod report;
pub mod sandbox;
mod task;
mod utils;

pub use crate::change::{ChangeDetector, ChangeKind, ChangeRecord, ChangeSet};
pub use crate::error::*;
pub use crate::executor::{BuildResult, Executor, TaskExecution, TaskOutcome, TaskState};
pub use crate::fingerprint::{DiskStore, Fingerprint, FingerprintSnapshot, MemoryStore, SnapshotStore};
pub use crate::graph::TaskGraph;
pub use crate::options::{AbortHandle, FailurePolicy, Options};
pub use crate::phase::TaskPhase;
pub use crate::registry::{Extension, Registry, TaskDeclaration};
pub use crate::report::Report;
pub use crate::task::{Task, TaskContext, TaskDescriptor};

/// Loads the extensions, orders their tasks and runs all of them.
///
/// Registration and graph errors are returned before any task runs. Task
/// failures never end up here; they are part of the returned [`BuildResult`].
pub fn run<I>(
    extensions: I,
    options: Options,
    store: &dyn SnapshotStore,
) -> Result<BuildResult, TsumikiError>
where
    I: IntoIterator<Item = Extension>,
{
    let registry = Registry::load(extensions)?;
    let graph = TaskGraph::build(&registry)?;

    tracing::debug!("Task graph:\n{graph}");

    Executor::new(options).run(&graph, store)
}
