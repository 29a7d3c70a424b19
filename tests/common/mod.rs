#![allow(dead_code)]

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tsumiki::{Task, TaskContext, TaskError};

/// A temporary working root.
pub struct Workspace {
    _guard: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let guard = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(guard.path().to_path_buf()).unwrap();
        Self {
            _guard: guard,
            root,
        }
    }

    pub fn write(&self, path: &str, content: &str) {
        let path = self.root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        fs::read_to_string(self.root.join(path)).unwrap()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }

    pub fn remove(&self, path: &str) {
        fs::remove_file(self.root.join(path)).unwrap();
    }
}

/// Shared, ordered log of task events.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("'{event}' not found in {:?}", self.events()))
    }
}

/// Copies files with the given extensions from one directory into another,
/// removing copies whose source was deleted.
pub struct Copier {
    pub target: String,
    pub extensions: Vec<String>,
    /// Every context this task was invoked with, as observed by the task.
    pub seen: Arc<Mutex<Vec<Observed>>>,
}

#[derive(Debug, Clone)]
pub struct Observed {
    pub incremental: bool,
    pub changes: Option<tsumiki::ChangeSet>,
}

impl Copier {
    pub fn new(target: &str, extensions: &[&str]) -> Self {
        Self {
            target: target.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            seen: Arc::default(),
        }
    }

    fn accepts(&self, path: &Utf8Path) -> bool {
        self.extensions.is_empty()
            || path
                .extension()
                .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }

    fn copy(&self, source: &Utf8Path, target: &Utf8Path) -> anyhow::Result<()> {
        if !self.accepts(source) {
            return Ok(());
        }
        let name = source.file_name().context("input has no file name")?;
        fs::copy(source, target.join(name))?;
        Ok(())
    }
}

impl Task for Copier {
    fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Observed {
            incremental: ctx.is_incremental(),
            changes: ctx.changes().cloned(),
        });

        let has_deletions = ctx.deleted_inputs().next().is_some();
        if ctx.all_inputs().is_empty() && !has_deletions {
            return Err(TaskError::user_input("no input files found").into());
        }

        let target = ctx.root().join(&self.target);
        if fs::create_dir_all(&target).is_err() {
            return Err(TaskError::action(format!("cannot create output directory {target}")).into());
        }

        let full = match ctx.changes() {
            None => true,
            Some(changes) => !changes.output_changes.is_empty(),
        };

        let sources = if full {
            ctx.all_inputs()
        } else {
            ctx.changed_inputs()
        };

        for source in sources {
            self.copy(source, &target)?;
        }

        for deleted in ctx.deleted_inputs() {
            if let Some(name) = deleted.file_name() {
                let copy = target.join(name);
                if copy.exists() {
                    fs::remove_file(copy)?;
                }
            }
        }

        Ok(())
    }
}
