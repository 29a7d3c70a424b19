//! Registration of tasks supplied by extension bundles.
//!
//! An [`Extension`] is an opaque bundle: a list of [`TaskDeclaration`]s, which
//! carry metadata only, and a lookup table from task name to the callable
//! [`Task`]. The [`Registry`] validates the metadata of every bundle together
//! and turns it into immutable [`TaskDescriptor`]s. No task code runs here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::RegistrationError;
use crate::phase::TaskPhase;
use crate::task::{Task, TaskContext, TaskDescriptor};

/// Metadata of a task, as declared by an extension.
#[derive(Debug, Clone)]
pub struct TaskDeclaration {
    name: String,
    description: String,
    phase: String,
    phase_index: Option<i32>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    dependents: BTreeSet<String>,
}

impl TaskDeclaration {
    /// A task in the `build` phase with no inputs, outputs or dependents.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            phase: TaskPhase::BUILD.name().to_string(),
            phase_index: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependents: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Runs the task in an already known phase, built in or declared with an
    /// index by some other task.
    pub fn phase(mut self, name: impl Into<String>) -> Self {
        self.phase = name.into();
        self.phase_index = None;
        self
    }

    /// Runs the task in the given phase, declaring it if necessary.
    pub fn in_phase(mut self, phase: TaskPhase) -> Self {
        self.phase = phase.name().to_string();
        self.phase_index = Some(phase.index());
        self
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Names tasks that may only start once this one completed.
    pub fn dependents<I, S>(mut self, dependents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependents
            .extend(dependents.into_iter().map(Into::into));
        self
    }
}

/// A bundle of task declarations and their implementations.
pub struct Extension {
    name: String,
    declarations: Vec<TaskDeclaration>,
    handles: HashMap<String, Arc<dyn Task>>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declarations: Vec::new(),
            handles: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares a task together with its implementation.
    pub fn task<T>(self, declaration: TaskDeclaration, task: T) -> Self
    where
        T: Task + 'static,
    {
        let name = declaration.name.clone();
        self.declare(declaration).provide(name, task)
    }

    /// Declares a task implemented by a closure.
    pub fn task_fn<F>(self, declaration: TaskDeclaration, callback: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.task(declaration, callback)
    }

    /// Adds task metadata only, the implementation is looked up by name.
    pub fn declare(mut self, declaration: TaskDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Adds an implementation to the lookup table.
    pub fn provide<T>(mut self, name: impl Into<String>, task: T) -> Self
    where
        T: Task + 'static,
    {
        self.handles.insert(name.into(), Arc::new(task));
        self
    }
}

/// The validated set of tasks of a build session.
///
/// The registry is an ordinary value: construct it with [`Registry::load`] and
/// pass it to [`TaskGraph::build`](crate::TaskGraph::build).
#[derive(Debug, Default)]
pub struct Registry {
    tasks: BTreeMap<String, Arc<TaskDescriptor>>,
    phases: BTreeMap<String, i32>,
}

impl Registry {
    pub fn load<I>(extensions: I) -> Result<Self, RegistrationError>
    where
        I: IntoIterator<Item = Extension>,
    {
        let extensions: Vec<Extension> = extensions.into_iter().collect();

        let mut phases: BTreeMap<String, i32> = TaskPhase::builtins()
            .iter()
            .map(|phase| (phase.name().to_string(), phase.index()))
            .collect();

        // Phases declared with an index, in any bundle, are known everywhere.
        for declaration in extensions.iter().flat_map(|e| &e.declarations) {
            if let Some(index) = declaration.phase_index {
                match phases.get(&declaration.phase) {
                    Some(&existing) if existing != index => {
                        return Err(RegistrationError::PhaseConflict {
                            phase: declaration.phase.clone(),
                            existing,
                            conflicting: index,
                        });
                    }
                    Some(_) => {}
                    None => {
                        phases.insert(declaration.phase.clone(), index);
                    }
                }
            }
        }

        let mut owners: HashMap<String, String> = HashMap::new();
        let mut tasks = BTreeMap::new();

        for extension in extensions {
            let Extension {
                name: extension,
                declarations,
                mut handles,
            } = extension;

            for declaration in declarations {
                if declaration.name.trim().is_empty() {
                    return Err(RegistrationError::EmptyName { extension });
                }

                if let Some(first) = owners.get(&declaration.name) {
                    return Err(RegistrationError::DuplicateTask {
                        name: declaration.name,
                        first: first.clone(),
                        second: extension,
                    });
                }

                let Some(&index) = phases.get(&declaration.phase) else {
                    return Err(RegistrationError::UnknownPhase {
                        task: declaration.name,
                        phase: declaration.phase,
                    });
                };

                let Some(task) = handles.remove(&declaration.name) else {
                    return Err(RegistrationError::MissingImplementation {
                        extension,
                        task: declaration.name,
                    });
                };

                owners.insert(declaration.name.clone(), extension.clone());

                let descriptor = TaskDescriptor {
                    name: declaration.name.clone(),
                    description: declaration.description,
                    phase: TaskPhase::new(declaration.phase, index),
                    inputs: declaration.inputs,
                    outputs: declaration.outputs,
                    dependents: declaration.dependents,
                    task,
                };

                tracing::debug!(
                    "registered task '{}' from '{}' in phase {}",
                    descriptor.name,
                    extension,
                    descriptor.phase
                );

                tasks.insert(declaration.name, Arc::new(descriptor));
            }

            for name in handles.keys() {
                tracing::warn!("extension '{}' provides undeclared task '{}'", extension, name);
            }
        }

        Ok(Self { tasks, phases })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskDescriptor>> {
        self.tasks.get(name)
    }

    /// All tasks, ordered by phase and then by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskDescriptor>> {
        let mut tasks: Vec<_> = self.tasks.values().collect();
        tasks.sort_by(|a, b| (a.phase(), a.name()).cmp(&(b.phase(), b.name())));
        tasks.into_iter()
    }

    /// Every known phase, built in or declared, ordered by index.
    pub fn phases(&self) -> Vec<TaskPhase> {
        let mut phases: Vec<_> = self
            .phases
            .iter()
            .map(|(name, &index)| TaskPhase::new(name.clone(), index))
            .collect();
        phases.sort();
        phases
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &TaskContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_load_orders_by_phase_then_name() {
        let registry = Registry::load([
            Extension::new("core")
                .task(TaskDeclaration::new("compile"), noop)
                .task(TaskDeclaration::new("clean").phase("setup"), noop),
            Extension::new("extra")
                .task(TaskDeclaration::new("archive").phase("tearDown"), noop)
                .task(TaskDeclaration::new("assemble"), noop),
        ])
        .unwrap();

        let names: Vec<_> = registry.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, ["clean", "assemble", "compile", "archive"]);
        assert_eq!(registry.get("clean").unwrap().phase(), &TaskPhase::SETUP);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_custom_phase_is_visible_to_other_bundles() {
        let registry = Registry::load([
            Extension::new("a").task(TaskDeclaration::new("lint").phase("check"), noop),
            Extension::new("b").task(
                TaskDeclaration::new("fmt").in_phase(TaskPhase::new("check", 700)),
                noop,
            ),
        ])
        .unwrap();

        assert_eq!(registry.get("lint").unwrap().phase().index(), 700);

        let phases: Vec<_> = registry.phases().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(phases, ["setup", "build", "check", "tearDown"]);
    }

    #[test]
    fn test_duplicate_names_across_bundles() {
        let err = Registry::load([
            Extension::new("a").task(TaskDeclaration::new("compile"), noop),
            Extension::new("b").task(TaskDeclaration::new("compile"), noop),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            RegistrationError::DuplicateTask {
                name: "compile".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn test_conflicting_phase_index() {
        let err = Registry::load([Extension::new("a")
            .task(
                TaskDeclaration::new("x").in_phase(TaskPhase::new("gen", 200)),
                noop,
            )
            .task(
                TaskDeclaration::new("y").in_phase(TaskPhase::new("gen", 300)),
                noop,
            )])
        .unwrap_err();

        assert!(matches!(err, RegistrationError::PhaseConflict { .. }));

        let err = Registry::load([Extension::new("a").task(
            TaskDeclaration::new("x").in_phase(TaskPhase::new("build", 1)),
            noop,
        )])
        .unwrap_err();

        assert_eq!(
            err,
            RegistrationError::PhaseConflict {
                phase: "build".into(),
                existing: 500,
                conflicting: 1,
            }
        );
    }

    #[test]
    fn test_unknown_phase() {
        let err = Registry::load([
            Extension::new("a").task(TaskDeclaration::new("x").phase("nowhere"), noop)
        ])
        .unwrap_err();

        assert!(matches!(err, RegistrationError::UnknownPhase { .. }));
    }

    #[test]
    fn test_missing_implementation() {
        let err = Registry::load([Extension::new("a")
            .declare(TaskDeclaration::new("x"))
            .provide("y", noop)])
        .unwrap_err();

        assert_eq!(
            err,
            RegistrationError::MissingImplementation {
                extension: "a".into(),
                task: "x".into(),
            }
        );
    }

    #[test]
    fn test_empty_name() {
        let err = Registry::load([Extension::new("a").task(TaskDeclaration::new(" "), noop)])
            .unwrap_err();

        assert!(matches!(err, RegistrationError::EmptyName { .. }));
    }

    #[test]
    fn test_registration_runs_no_task_code() {
        let registry = Registry::load([Extension::new("a").task_fn(
            TaskDeclaration::new("boom"),
            |_| panic!("task code must not run during registration"),
        )])
        .unwrap();

        assert_eq!(registry.len(), 1);
    }
}
