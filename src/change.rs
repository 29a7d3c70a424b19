//! Incremental change detection.
//!
//! Before a task runs, its declared inputs and outputs are resolved and
//! compared with the fingerprints captured after its last successful run.
//! The resulting [`ChangeSet`] is what the task sees as "changed".

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::TaskDescriptor;
use crate::fingerprint::{Fingerprint, FingerprintSnapshot};
use crate::matcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub path: Utf8PathBuf,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn new(path: impl Into<Utf8PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// The delta of a task's inputs and outputs since its last successful run.
///
/// Both groups are sorted by path, so the same filesystem state always
/// produces the same change set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub input_changes: Vec<ChangeRecord>,
    pub output_changes: Vec<ChangeRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.input_changes.is_empty() && self.output_changes.is_empty()
    }

    /// Paths of the inputs that were added or modified.
    pub fn changed_inputs(&self) -> impl Iterator<Item = &Utf8Path> {
        existing(&self.input_changes)
    }

    /// Paths of the outputs that were added or modified.
    pub fn changed_outputs(&self) -> impl Iterator<Item = &Utf8Path> {
        existing(&self.output_changes)
    }

    pub fn deleted_inputs(&self) -> impl Iterator<Item = &Utf8Path> {
        deleted(&self.input_changes)
    }

    pub fn deleted_outputs(&self) -> impl Iterator<Item = &Utf8Path> {
        deleted(&self.output_changes)
    }
}

fn existing(records: &[ChangeRecord]) -> impl Iterator<Item = &Utf8Path> {
    records
        .iter()
        .filter(|record| record.kind != ChangeKind::Deleted)
        .map(|record| record.path.as_path())
}

fn deleted(records: &[ChangeRecord]) -> impl Iterator<Item = &Utf8Path> {
    records
        .iter()
        .filter(|record| record.kind == ChangeKind::Deleted)
        .map(|record| record.path.as_path())
}

/// The resolved state of a task right before it runs.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub inputs: BTreeSet<Utf8PathBuf>,
    pub outputs: BTreeSet<Utf8PathBuf>,
    pub changes: ChangeSet,
    /// `false` when there was no previous snapshot to compare against.
    pub incremental: bool,
}

/// Computes change sets for tasks whose specs are relative to `root`.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector<'a> {
    root: &'a Utf8Path,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(root: &'a Utf8Path) -> Self {
        Self { root }
    }

    pub fn detect(
        &self,
        task: &TaskDescriptor,
        previous: Option<&FingerprintSnapshot>,
    ) -> io::Result<Detection> {
        self.detect_specs(task.inputs(), task.outputs(), previous)
    }

    pub fn detect_specs(
        &self,
        inputs: &[String],
        outputs: &[String],
        previous: Option<&FingerprintSnapshot>,
    ) -> io::Result<Detection> {
        let inputs = matcher::resolve_all(inputs, self.root)?;
        let outputs = matcher::resolve_all(outputs, self.root)?;

        // First run, everything is new and there is nothing to say about outputs.
        let Some(previous) = previous else {
            let input_changes = inputs
                .iter()
                .map(|path| ChangeRecord::new(path.clone(), ChangeKind::Added))
                .collect();

            return Ok(Detection {
                inputs,
                outputs,
                changes: ChangeSet {
                    input_changes,
                    output_changes: Vec::new(),
                },
                incremental: false,
            });
        };

        let current = FingerprintSnapshot::capture(&inputs, &outputs)?;

        let output_changes = diff(&previous.outputs, &current.outputs);
        let mut input_changes = diff(&previous.inputs, &current.inputs);

        if !output_changes.is_empty() {
            tracing::debug!(
                "{} output change(s), treating every input as changed",
                output_changes.len()
            );
            input_changes = invalidate(&inputs, input_changes);
        }

        Ok(Detection {
            inputs,
            outputs,
            changes: ChangeSet {
                input_changes,
                output_changes,
            },
            incremental: true,
        })
    }
}

fn diff(
    previous: &BTreeMap<Utf8PathBuf, Fingerprint>,
    current: &BTreeMap<Utf8PathBuf, Fingerprint>,
) -> Vec<ChangeRecord> {
    let mut changes = Vec::new();

    for (path, fingerprint) in current {
        match previous.get(path) {
            None => changes.push(ChangeRecord::new(path.clone(), ChangeKind::Added)),
            Some(old) if old != fingerprint => {
                changes.push(ChangeRecord::new(path.clone(), ChangeKind::Modified))
            }
            Some(_) => {}
        }
    }

    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.push(ChangeRecord::new(path.clone(), ChangeKind::Deleted));
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

/// Reports every current input as changed, keeping deletions and the real
/// kind of inputs that did change.
fn invalidate(inputs: &BTreeSet<Utf8PathBuf>, changes: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let known: BTreeMap<&Utf8Path, ChangeKind> = changes
        .iter()
        .map(|record| (record.path.as_path(), record.kind))
        .collect();

    let mut all: Vec<ChangeRecord> = inputs
        .iter()
        .map(|path| {
            let kind = known
                .get(path.as_path())
                .copied()
                .unwrap_or(ChangeKind::Modified);
            ChangeRecord::new(path.clone(), kind)
        })
        .collect();

    all.extend(
        changes
            .iter()
            .filter(|record| record.kind == ChangeKind::Deleted)
            .cloned(),
    );

    all.sort_by(|a, b| a.path.cmp(&b.path));
    all
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    struct Fixture {
        _guard: tempfile::TempDir,
        root: Utf8PathBuf,
        inputs: Vec<String>,
        outputs: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            let guard = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::try_from(guard.path().to_path_buf()).unwrap();

            fs::create_dir_all(root.join("in")).unwrap();
            fs::create_dir_all(root.join("out")).unwrap();
            for name in ["c.txt", "a.txt", "b.txt"] {
                fs::write(root.join("in").join(name), name).unwrap();
            }

            Self {
                _guard: guard,
                root,
                inputs: vec!["in/*".into()],
                outputs: vec!["out/*".into()],
            }
        }

        fn detect(&self, previous: Option<&FingerprintSnapshot>) -> Detection {
            ChangeDetector::new(&self.root)
                .detect_specs(&self.inputs, &self.outputs, previous)
                .unwrap()
        }

        /// What the engine stores after a successful run.
        fn snapshot(&self) -> FingerprintSnapshot {
            let detection = self.detect(None);
            FingerprintSnapshot::capture(&detection.inputs, &detection.outputs).unwrap()
        }

        fn path(&self, relative: &str) -> Utf8PathBuf {
            self.root.join(relative)
        }
    }

    #[test]
    fn test_first_run_marks_all_inputs_added() {
        let fixture = Fixture::new();
        fs::write(fixture.path("out/a.txt"), "a").unwrap();

        let detection = fixture.detect(None);

        assert!(!detection.incremental);
        assert_eq!(
            detection.changes.input_changes,
            vec![
                ChangeRecord::new(fixture.path("in/a.txt"), ChangeKind::Added),
                ChangeRecord::new(fixture.path("in/b.txt"), ChangeKind::Added),
                ChangeRecord::new(fixture.path("in/c.txt"), ChangeKind::Added),
            ]
        );
        assert!(detection.changes.output_changes.is_empty());
        assert_eq!(detection.outputs.len(), 1);
    }

    #[test]
    fn test_no_changes_is_empty() {
        let fixture = Fixture::new();
        let snapshot = fixture.snapshot();

        let detection = fixture.detect(Some(&snapshot));
        assert!(detection.incremental);
        assert!(detection.changes.is_empty());
        assert_eq!(detection.inputs.len(), 3);
    }

    #[test]
    fn test_input_modified_added_deleted() {
        let fixture = Fixture::new();
        let snapshot = fixture.snapshot();

        fs::write(fixture.path("in/a.txt"), "edited").unwrap();
        fs::remove_file(fixture.path("in/b.txt")).unwrap();
        fs::write(fixture.path("in/d.txt"), "new").unwrap();

        let detection = fixture.detect(Some(&snapshot));
        assert_eq!(
            detection.changes.input_changes,
            vec![
                ChangeRecord::new(fixture.path("in/a.txt"), ChangeKind::Modified),
                ChangeRecord::new(fixture.path("in/b.txt"), ChangeKind::Deleted),
                ChangeRecord::new(fixture.path("in/d.txt"), ChangeKind::Added),
            ]
        );
        assert!(!detection.inputs.contains(&fixture.path("in/b.txt")));

        let deleted: Vec<_> = detection.changes.deleted_inputs().collect();
        assert_eq!(deleted, [fixture.path("in/b.txt").as_path()]);
        assert_eq!(detection.changes.changed_inputs().count(), 2);
    }

    #[test]
    fn test_output_change_invalidates_all_inputs() {
        let fixture = Fixture::new();
        fs::write(fixture.path("out/a.txt"), "a.txt").unwrap();
        let snapshot = fixture.snapshot();

        fs::write(fixture.path("out/a.txt"), "tampered").unwrap();
        fs::remove_file(fixture.path("in/c.txt")).unwrap();

        let detection = fixture.detect(Some(&snapshot));
        assert_eq!(
            detection.changes.output_changes,
            vec![ChangeRecord::new(fixture.path("out/a.txt"), ChangeKind::Modified)]
        );
        assert_eq!(
            detection.changes.input_changes,
            vec![
                ChangeRecord::new(fixture.path("in/a.txt"), ChangeKind::Modified),
                ChangeRecord::new(fixture.path("in/b.txt"), ChangeKind::Modified),
                ChangeRecord::new(fixture.path("in/c.txt"), ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn test_deleted_output_is_reported() {
        let fixture = Fixture::new();
        fs::write(fixture.path("out/a.txt"), "a.txt").unwrap();
        let snapshot = fixture.snapshot();

        fs::remove_file(fixture.path("out/a.txt")).unwrap();

        let detection = fixture.detect(Some(&snapshot));
        let deleted: Vec<_> = detection.changes.deleted_outputs().collect();
        assert_eq!(deleted, [fixture.path("out/a.txt").as_path()]);
        assert_eq!(detection.changes.input_changes.len(), 3);
    }
}
