use std::fmt::{Display, Formatter};

use console::style;

use crate::error::FailureKind;
use crate::executor::{BuildResult, TaskState};

/// Human readable summary of a [`BuildResult`].
///
/// Expected failures are shown as one line. Unexpected and io failures also
/// print their full diagnostic detail.
pub struct Report<'a>(pub &'a BuildResult);

impl<'a> Report<'a> {
    pub fn new(result: &'a BuildResult) -> Self {
        Self(result)
    }
}

impl Display for Report<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let result = self.0;

        for (name, outcome) in &result.tasks {
            let label = match outcome.state {
                TaskState::Succeeded if outcome.up_to_date => style("UP-TO-DATE").dim(),
                TaskState::Succeeded => style("SUCCEEDED").green(),
                TaskState::Failed => style("FAILED").red().bold(),
                TaskState::Skipped => style("SKIPPED").yellow(),
                _ => style("PENDING").dim(),
            };

            write!(f, "{:>10} {} [{}]", label, name, outcome.phase)?;
            if let Some(execution) = &outcome.execution {
                write!(f, " {:.2?}", execution.duration)?;
            }
            writeln!(f)?;

            if let Some(reason) = &outcome.skip_reason {
                writeln!(f, "           {}", style(reason).dim())?;
            }

            if let Some(failure) = &outcome.failure {
                writeln!(f, "           {}: {}", failure.kind, failure.message)?;
                let verbose = matches!(failure.kind, FailureKind::Unexpected | FailureKind::Io);
                if let Some(detail) = failure.detail.as_ref().filter(|_| verbose) {
                    for line in detail.lines() {
                        writeln!(f, "           {}", style(line).dim())?;
                    }
                }
            }
        }

        let status = if result.is_success() {
            style("Build succeeded").green().bold()
        } else if result.aborted {
            style("Build aborted").red().bold()
        } else {
            style("Build failed").red().bold()
        };

        write!(
            f,
            "{}: {} succeeded, {} failed, {} skipped",
            status,
            result.count(TaskState::Succeeded),
            result.count(TaskState::Failed),
            result.count(TaskState::Skipped),
        )
    }
}
