//! Pluggable checkpoint storage
//!
//! A store owns exactly one namespace (one pipeline run). Records are
//! appended to a ledger and never edited in place; the only removal path
//! is [`CheckpointStore::remove`], used by age-based cleanup.
//!
//! - [`FsCheckpointStore`]: durable local disk, JSON-lines ledger plus one
//!   directory of copied files per checkpoint
//! - [`MemoryCheckpointStore`]: process-local, for tests and dry runs

use crate::error::CheckpointError;
use crate::record::Checkpoint;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

/// Contents of a captured file set, keyed by workspace-relative path
pub type SnapshotFiles = BTreeMap<String, Vec<u8>>;

const LEDGER_FILE: &str = "ledger.jsonl";
const SNAPSHOT_DIR: &str = "snapshots";

/// Append-only storage for one namespace
pub trait CheckpointStore: Send + Sync {
    /// Namespace served by this store
    fn namespace(&self) -> &str;

    /// Persist the copied files of a checkpoint
    fn write_snapshot(&self, id: &str, files: &SnapshotFiles) -> Result<(), CheckpointError>;

    /// Read back the requested files of a checkpoint
    ///
    /// Files that are no longer in storage are omitted from the result
    /// rather than reported as errors, so callers can detect tampering
    /// through the content hash.
    fn read_snapshot(&self, id: &str, paths: &[&str]) -> Result<SnapshotFiles, CheckpointError>;

    /// Append a record to the ledger
    fn append(&self, record: &Checkpoint) -> Result<(), CheckpointError>;

    /// All records in append order
    fn records(&self) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Drop records and their snapshots
    fn remove(&self, ids: &[String]) -> Result<(), CheckpointError>;
}

/// Reject absolute paths and parent traversal
pub(crate) fn check_relative(path: &str) -> Result<&Path, CheckpointError> {
    let p = Path::new(path);
    let ok = !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(p)
    } else {
        Err(CheckpointError::InvalidPath(path.to_string()))
    }
}

/// Canonical `a/b/c` form of a workspace-relative path
///
/// `./state.json` and `state.json` collapse to the same key.
pub(crate) fn normalize_relative(path: &str) -> Result<String, CheckpointError> {
    let parts: Vec<&str> = check_relative(path)?
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        return Err(CheckpointError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// Filesystem-backed store under `<root>/<namespace>/`
#[derive(Debug)]
pub struct FsCheckpointStore {
    namespace: String,
    dir: PathBuf,
    ledger_lock: Mutex<()>,
}

impl FsCheckpointStore {
    /// Open (creating if needed) the namespace directory under `root`
    ///
    /// # Errors
    /// Returns error if the namespace name is not a single path component
    /// or the directory cannot be created.
    pub fn open(root: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self, CheckpointError> {
        let namespace = namespace.into();
        let valid = check_relative(&namespace)?.components().count() == 1;
        if !valid {
            return Err(CheckpointError::InvalidPath(namespace));
        }
        let dir = root.as_ref().join(&namespace);
        fs::create_dir_all(dir.join(SNAPSHOT_DIR)).map_err(|e| CheckpointError::io(&dir, e))?;
        Ok(Self {
            namespace,
            dir,
            ledger_lock: Mutex::new(()),
        })
    }

    /// Namespaces that exist under `root`, sorted
    ///
    /// # Errors
    /// Returns error if `root` exists but cannot be read.
    pub fn namespaces(root: impl AsRef<Path>) -> Result<Vec<String>, CheckpointError> {
        let root = root.as_ref();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(root, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(root, e))?;
            if entry.path().join(LEDGER_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Directory holding this namespace
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the copied files of one checkpoint
    #[must_use]
    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.dir.join(SNAPSHOT_DIR).join(id)
    }

    fn ledger_path(&self) -> PathBuf {
        self.dir.join(LEDGER_FILE)
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn write_snapshot(&self, id: &str, files: &SnapshotFiles) -> Result<(), CheckpointError> {
        let base = self.snapshot_dir(id);
        for (rel, contents) in files {
            let target = base.join(check_relative(rel)?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
            }
            fs::write(&target, contents).map_err(|e| CheckpointError::io(&target, e))?;
        }
        // Empty file sets still get a directory so the checkpoint is inspectable.
        fs::create_dir_all(&base).map_err(|e| CheckpointError::io(&base, e))?;
        Ok(())
    }

    fn read_snapshot(&self, id: &str, paths: &[&str]) -> Result<SnapshotFiles, CheckpointError> {
        let base = self.snapshot_dir(id);
        let mut files = SnapshotFiles::new();
        for rel in paths {
            let source = base.join(check_relative(rel)?);
            match fs::read(&source) {
                Ok(bytes) => {
                    files.insert((*rel).to_string(), bytes);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(&source, e)),
            }
        }
        Ok(files)
    }

    fn append(&self, record: &Checkpoint) -> Result<(), CheckpointError> {
        let _guard = self.ledger_lock.lock();
        let path = self.ledger_path();
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CheckpointError::io(&path, e))?;
        file.write_all(&line)
            .and_then(|()| file.sync_data())
            .map_err(|e| CheckpointError::io(&path, e))
    }

    fn records(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let _guard = self.ledger_lock.lock();
        let path = self.ledger_path();
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&path, e)),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| CheckpointError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn remove(&self, ids: &[String]) -> Result<(), CheckpointError> {
        if ids.is_empty() {
            return Ok(());
        }
        let kept: Vec<Checkpoint> = self
            .records()?
            .into_iter()
            .filter(|r| !ids.contains(&r.id))
            .collect();

        let _guard = self.ledger_lock.lock();
        let path = self.ledger_path();
        let tmp = self.dir.join(format!("{LEDGER_FILE}.tmp"));
        let mut buf = Vec::new();
        for record in &kept {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        fs::write(&tmp, &buf).map_err(|e| CheckpointError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| CheckpointError::io(&path, e))?;

        for id in ids {
            let dir = self.snapshot_dir(id);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(&dir, e)),
            }
        }
        Ok(())
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    namespace: String,
    records: Mutex<Vec<Checkpoint>>,
    snapshots: Mutex<HashMap<String, SnapshotFiles>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store for `namespace`
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Overwrite one stored file of a snapshot
    ///
    /// Lets callers simulate storage damage.
    pub fn overwrite_snapshot_file(&self, id: &str, path: &str, contents: Vec<u8>) {
        self.snapshots
            .lock()
            .entry(id.to_string())
            .or_default()
            .insert(path.to_string(), contents);
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn write_snapshot(&self, id: &str, files: &SnapshotFiles) -> Result<(), CheckpointError> {
        for rel in files.keys() {
            check_relative(rel)?;
        }
        self.snapshots.lock().insert(id.to_string(), files.clone());
        Ok(())
    }

    fn read_snapshot(&self, id: &str, paths: &[&str]) -> Result<SnapshotFiles, CheckpointError> {
        let snapshots = self.snapshots.lock();
        let stored = snapshots
            .get(id)
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;
        Ok(paths
            .iter()
            .filter_map(|p| stored.get(*p).map(|b| ((*p).to_string(), b.clone())))
            .collect())
    }

    fn append(&self, record: &Checkpoint) -> Result<(), CheckpointError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn records(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.records.lock().clone())
    }

    fn remove(&self, ids: &[String]) -> Result<(), CheckpointError> {
        self.records.lock().retain(|r| !ids.contains(&r.id));
        let mut snapshots = self.snapshots.lock();
        for id in ids {
            snapshots.remove(id);
        }
        Ok(())
    }
}
