//! Content signatures of filesystem entities and their persistence.
//!
//! A [`FingerprintSnapshot`] records the signature of every input and output
//! a task resolved after its last successful run. The next run compares the
//! current state of the filesystem against it to find out what changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 signature of a filesystem entity.
///
/// Files are signed by their content. Directories are signed by the sorted
/// names of their direct children, so adding or removing a child changes the
/// signature of the directory while editing a child does not.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    pub fn of_bytes(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn of_file(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub fn of_dir(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let mut names = fs::read_dir(path)?
            .map(|entry| entry.map(|entry| entry.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"dir\0");
        for name in names {
            hasher.update(name.as_encoded_bytes());
            hasher.update(b"\0");
        }

        Ok(hasher.finalize().into())
    }

    /// Signs whatever lives at `path`, following symbolic links.
    pub fn of_entity(path: &Utf8Path) -> io::Result<Self> {
        if fs::metadata(path)?.is_dir() {
            Self::of_dir(path)
        } else {
            Self::of_file(path)
        }
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Signatures of a task's inputs and outputs after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSnapshot {
    pub inputs: BTreeMap<Utf8PathBuf, Fingerprint>,
    pub outputs: BTreeMap<Utf8PathBuf, Fingerprint>,
}

impl FingerprintSnapshot {
    /// Signs every resolved entity. Entities are hashed in parallel.
    pub fn capture(
        inputs: &BTreeSet<Utf8PathBuf>,
        outputs: &BTreeSet<Utf8PathBuf>,
    ) -> io::Result<Self> {
        Ok(Self {
            inputs: sign_all(inputs)?,
            outputs: sign_all(outputs)?,
        })
    }
}

fn sign_all(paths: &BTreeSet<Utf8PathBuf>) -> io::Result<BTreeMap<Utf8PathBuf, Fingerprint>> {
    paths
        .par_iter()
        .map(|path| -> io::Result<_> { Ok((path.clone(), Fingerprint::of_entity(path)?)) })
        .collect()
}

/// Persisted fingerprint snapshots, partitioned by task name.
///
/// Implementations must replace a snapshot atomically: a reader observes
/// either the previous snapshot or the new one, never a mix of both.
pub trait SnapshotStore: Send + Sync {
    /// Returns the snapshot of the last successful run, if there is one.
    fn load(&self, task: &str) -> io::Result<Option<FingerprintSnapshot>>;

    /// Replaces the snapshot of `task`.
    fn replace(&self, task: &str, snapshot: &FingerprintSnapshot) -> io::Result<()>;

    /// Drops the snapshot of `task`, the next run will be a full one.
    fn forget(&self, task: &str) -> io::Result<()>;
}

/// Keeps one CBOR file per task in a state directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: Utf8PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Stores snapshots in `<root>/.tsumiki`.
    pub fn in_root(root: &Utf8Path) -> Self {
        Self::new(root.join(".tsumiki"))
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn path_for(&self, task: &str) -> Utf8PathBuf {
        // Task names are arbitrary strings, so they are not used as file names.
        let name = Fingerprint::of_bytes(task).to_hex();
        self.dir.join(name).with_extension("cbor")
    }
}

impl SnapshotStore for DiskStore {
    fn load(&self, task: &str) -> io::Result<Option<FingerprintSnapshot>> {
        let path = self.path_for(task);

        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match ciborium::from_reader(BufReader::new(file)) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(ciborium::de::Error::Io(e)) => Err(e),
            Err(e) => {
                // An unreadable snapshot carries no incremental information.
                tracing::warn!("discarding corrupted fingerprints of '{}' at {}: {}", task, path, e);
                Ok(None)
            }
        }
    }

    fn replace(&self, task: &str, snapshot: &FingerprintSnapshot) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(task);
        let temp = path.with_extension("cbor.tmp");

        {
            let file = fs::File::create(&temp)?;
            let mut writer = BufWriter::new(file);
            ciborium::into_writer(snapshot, &mut writer).map_err(|e| match e {
                ciborium::ser::Error::Io(e) => e,
                ciborium::ser::Error::Value(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
            })?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&temp, &path)
    }

    fn forget(&self, task: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(task)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Keeps snapshots in memory for the lifetime of the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, FingerprintSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, task: &str) -> io::Result<Option<FingerprintSnapshot>> {
        Ok(self.map.lock().unwrap_or_else(PoisonError::into_inner).get(task).cloned())
    }

    fn replace(&self, task: &str, snapshot: &FingerprintSnapshot) -> io::Result<()> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.to_string(), snapshot.clone());
        Ok(())
    }

    fn forget(&self, task: &str) -> io::Result<()> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).remove(task);
        Ok(())
    }
}
