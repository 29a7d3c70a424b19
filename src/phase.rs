use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::Serialize;

/// A coarse build stage.
///
/// Every task runs in exactly one phase. Phases are totally ordered by their
/// index, and a phase acts as a hard barrier: no task of a later phase starts
/// before every task of an earlier phase has finished, no matter how the
/// explicit dependencies between tasks are declared.
///
/// Three phases are built in, [`TaskPhase::SETUP`], [`TaskPhase::BUILD`] and
/// [`TaskPhase::TEAR_DOWN`]. Extensions may declare their own phases with
/// arbitrary indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TaskPhase {
    name: Cow<'static, str>,
    index: i32,
}

impl TaskPhase {
    /// Preparation work, runs first.
    pub const SETUP: TaskPhase = TaskPhase::builtin("setup", 100);
    /// The default phase.
    pub const BUILD: TaskPhase = TaskPhase::builtin("build", 500);
    /// Cleanup and packaging, runs last.
    pub const TEAR_DOWN: TaskPhase = TaskPhase::builtin("tearDown", 1000);

    const fn builtin(name: &'static str, index: i32) -> Self {
        Self {
            name: Cow::Borrowed(name),
            index,
        }
    }

    pub fn new(name: impl Into<Cow<'static, str>>, index: i32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Phases are ordered according to this index, lower runs earlier.
    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn builtins() -> [TaskPhase; 3] {
        [Self::SETUP, Self::BUILD, Self::TEAR_DOWN]
    }
}

impl Default for TaskPhase {
    fn default() -> Self {
        Self::BUILD
    }
}

impl Ord for TaskPhase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for TaskPhase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for TaskPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_order() {
        let mut phases = vec![TaskPhase::TEAR_DOWN, TaskPhase::SETUP, TaskPhase::BUILD];
        phases.sort();

        let names: Vec<_> = phases.iter().map(TaskPhase::name).collect();
        assert_eq!(names, ["setup", "build", "tearDown"]);
    }

    #[test]
    fn test_custom_phase_between_builtins() {
        let custom = TaskPhase::new("generate", 300);
        assert!(TaskPhase::SETUP < custom);
        assert!(custom < TaskPhase::BUILD);
        assert_eq!(custom.to_string(), "generate(300)");
    }
}
