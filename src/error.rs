use std::fmt::{Display, Formatter};

use serde::Serialize;
use thiserror::Error;

use crate::phase::TaskPhase;

/// Errors which prevent a build from starting at all.
#[derive(Debug, Error)]
pub enum TsumikiError {
    #[error("Error while registering tasks:\n{0}")]
    Registration(#[from] RegistrationError),

    #[error("Invalid task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Progress(#[from] indicatif::style::TemplateError),
}

/// Malformed or conflicting task metadata.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Extension '{extension}' declares a task with an empty name")]
    EmptyName { extension: String },

    #[error("Task '{name}' is declared by both '{first}' and '{second}'")]
    DuplicateTask {
        name: String,
        first: String,
        second: String,
    },

    #[error("Phase '{phase}' is declared with conflicting indices {existing} and {conflicting}")]
    PhaseConflict {
        phase: String,
        existing: i32,
        conflicting: i32,
    },

    #[error("Task '{task}' refers to unknown phase '{phase}'")]
    UnknownPhase { task: String, phase: String },

    #[error("Extension '{extension}' has no implementation for task '{task}'")]
    MissingImplementation { extension: String, task: String },
}

/// The declared tasks cannot be ordered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cyclic dependency: {}", render_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Task '{task}' names unknown dependent '{dependent}'")]
    UnknownDependent { task: String, dependent: String },

    #[error("Unknown task '{0}'")]
    UnknownTask(String),
}

fn render_cycle(cycle: &[String]) -> String {
    let mut out = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

/// Expected failures a task may signal.
///
/// Returning one of these from [`Task::run`](crate::Task::run) marks the task
/// as failed without treating it as a defect in the task itself, so no
/// internal detail is reported. Everything else is considered unexpected.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The build-level input is wrong, e.g. a required directory is missing.
    #[error("{0}")]
    UserInput(String),

    /// The task could not complete its declared action.
    #[error("{0}")]
    Action(String),
}

impl TaskError {
    pub fn user_input(message: impl Into<String>) -> Self {
        Self::UserInput(message.into())
    }

    pub fn action(message: impl Into<String>) -> Self {
        Self::Action(message.into())
    }
}

/// Classification of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    UserInput,
    Action,
    /// Defect in the task implementation, including panics.
    Unexpected,
    /// The engine's own filesystem work failed for this task.
    Io,
}

impl FailureKind {
    /// Expected failures are reported without internal detail.
    pub fn is_expected(self) -> bool {
        matches!(self, FailureKind::UserInput | FailureKind::Action)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::UserInput => "user input error",
            FailureKind::Action => "action error",
            FailureKind::Unexpected => "unexpected error",
            FailureKind::Io => "io error",
        };
        f.write_str(label)
    }
}

/// A classified failure of a single task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub phase: TaskPhase,
    pub kind: FailureKind,
    pub message: String,
    /// Full diagnostic detail, only present for unexpected and io failures.
    pub detail: Option<String>,
}

impl TaskFailure {
    pub(crate) fn io(
        task: &crate::TaskDescriptor,
        context: &str,
        error: std::io::Error,
    ) -> Self {
        Self {
            task: task.name().to_string(),
            phase: task.phase().clone(),
            kind: FailureKind::Io,
            message: format!("{context}: {error}"),
            detail: Some(format!("{error:?}")),
        }
    }

    pub(crate) fn unexpected(
        task: &crate::TaskDescriptor,
        message: String,
        detail: String,
    ) -> Self {
        Self {
            task: task.name().to_string(),
            phase: task.phase().clone(),
            kind: FailureKind::Unexpected,
            message,
            detail: Some(detail),
        }
    }
}

impl Display for TaskFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task '{}' ({}): {}", self.task, self.kind, self.message)
    }
}

impl std::error::Error for TaskFailure {}
