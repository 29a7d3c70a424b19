use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

/// What happens to the rest of the build once a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    /// Skip only the tasks that (transitively) declared the failed task as a
    /// prerequisite, keep running everything else.
    #[default]
    SkipDependents,
    /// Stop admitting new tasks, let running tasks finish and skip the rest.
    Abort,
}

/// A shared flag used to stop a running build.
///
/// Aborting never interrupts a task that is already running; it only keeps
/// new tasks from starting. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Build configuration.
///
/// ```rust
/// use tsumiki::{FailurePolicy, Options};
///
/// let options = Options::default()
///     .root("project")
///     .workers(4)
///     .policy(FailurePolicy::Abort)
///     .args(["--release"]);
///
/// assert_eq!(options.get_workers(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) root: Utf8PathBuf,
    pub(crate) workers: usize,
    pub(crate) policy: FailurePolicy,
    pub(crate) args: Vec<String>,
    pub(crate) abort: AbortHandle,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            policy: FailurePolicy::default(),
            args: Vec::new(),
            abort: AbortHandle::default(),
        }
    }
}

impl Options {
    /// Directory that input and output specs are relative to.
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Maximum number of tasks running at the same time, at least one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Arguments passed through to every task.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Uses an externally controlled abort flag, e.g. one set on Ctrl-C.
    pub fn abort_handle(mut self, handle: AbortHandle) -> Self {
        self.abort = handle;
        self
    }

    pub fn get_root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn get_workers(&self) -> usize {
        self.workers
    }

    pub fn get_policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn get_abort_handle(&self) -> &AbortHandle {
        &self.abort
    }
}
