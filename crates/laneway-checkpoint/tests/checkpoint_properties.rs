//! Checkpoint properties against the filesystem store:
//! - identical state yields identical hashes
//! - restore then re-create reproduces the original hash
//! - a tampered snapshot is refused and the workspace is left as-is
//! - cleanup honours the retention window

use chrono::{DateTime, Duration, TimeZone, Utc};
use laneway_checkpoint::{
    CheckpointError, CheckpointManager, CheckpointRequest, CheckpointSettings, Clock,
    FsCheckpointStore,
};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::Arc;

struct TestClock(Mutex<DateTime<Utc>>);

impl TestClock {
    fn at(t: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(t)))
    }

    fn advance(&self, by: Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

fn write(root: &Path, rel: &str, contents: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, contents).unwrap();
}

struct Fixture {
    workspace: tempfile::TempDir,
    storage: tempfile::TempDir,
    manager: CheckpointManager,
}

fn fixture(clock: Arc<dyn Clock>) -> Fixture {
    let workspace = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    write(workspace.path(), "Cargo.toml", "[package]\nname = \"demo\"\n");
    write(workspace.path(), "Cargo.lock", "# lock v1\n");
    write(workspace.path(), ".laneway/state.json", "{\"stage\":0}");

    let store = Arc::new(FsCheckpointStore::open(storage.path(), "run-abc").unwrap());
    let settings = CheckpointSettings::new(workspace.path())
        .with_critical_files(["Cargo.toml", "Cargo.lock", ".laneway/state.json"]);
    let manager = CheckpointManager::new(settings, store).with_clock(clock);
    Fixture {
        workspace,
        storage,
        manager,
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

#[test]
fn unchanged_state_yields_identical_hashes() {
    let f = fixture(TestClock::at(start()));
    let a = f
        .manager
        .create(CheckpointRequest::success("standard", 2, "unit-tests"))
        .unwrap();
    let b = f
        .manager
        .create(CheckpointRequest::success("standard", 2, "unit-tests"))
        .unwrap();

    assert_eq!(a.content_hash, b.content_hash);
    assert_ne!(a.id, b.id);
}

#[test]
fn restore_then_create_reproduces_hash() {
    let f = fixture(TestClock::at(start()));
    let original = f
        .manager
        .create(CheckpointRequest::success("standard", 1, "lint"))
        .unwrap();

    write(f.workspace.path(), "Cargo.lock", "# lock v2\n");
    write(f.workspace.path(), ".laneway/state.json", "{\"stage\":3}");
    let drifted = f
        .manager
        .create(CheckpointRequest::failure("standard", 3, "build", "linker error"))
        .unwrap();
    assert_ne!(drifted.content_hash, original.content_hash);

    assert!(f.manager.restore(&original.id).unwrap());
    let again = f
        .manager
        .create(CheckpointRequest::success("standard", 1, "lint"))
        .unwrap();
    assert_eq!(again.content_hash, original.content_hash);
}

#[test]
fn tampered_snapshot_is_refused_and_workspace_untouched() {
    let f = fixture(TestClock::at(start()));
    let cp = f
        .manager
        .create(CheckpointRequest::success("heavy", 1, "lint"))
        .unwrap();

    write(f.workspace.path(), "Cargo.toml", "[package]\nname = \"edited\"\n");
    let before_toml = fs::read(f.workspace.path().join("Cargo.toml")).unwrap();
    let before_lock = fs::read(f.workspace.path().join("Cargo.lock")).unwrap();

    let stored = f
        .storage
        .path()
        .join("run-abc")
        .join("snapshots")
        .join(&cp.id)
        .join("Cargo.lock");
    fs::write(&stored, "# lock tampered\n").unwrap();

    match f.manager.restore(&cp.id) {
        Err(CheckpointError::Corruption { id, expected, .. }) => {
            assert_eq!(id, cp.id);
            assert_eq!(expected, cp.content_hash);
        }
        other => panic!("expected Corruption, got {other:?}"),
    }
    assert_eq!(fs::read(f.workspace.path().join("Cargo.toml")).unwrap(), before_toml);
    assert_eq!(fs::read(f.workspace.path().join("Cargo.lock")).unwrap(), before_lock);
}

#[test]
fn corruption_does_not_affect_other_checkpoints() {
    let f = fixture(TestClock::at(start()));
    let first = f
        .manager
        .create(CheckpointRequest::success("standard", 1, "lint"))
        .unwrap();
    let second = f
        .manager
        .create(CheckpointRequest::success("standard", 2, "test"))
        .unwrap();

    let stored = f
        .storage
        .path()
        .join("run-abc/snapshots")
        .join(&second.id)
        .join("Cargo.toml");
    fs::remove_file(stored).unwrap();

    assert!(f.manager.restore(&second.id).unwrap_err().is_corruption());
    assert!(f.manager.restore(&first.id).is_ok());
}

#[test]
fn cleanup_honours_seven_day_retention() {
    let clock = TestClock::at(start());
    let f = fixture(clock.clone());

    let old = f
        .manager
        .create(CheckpointRequest::success("standard", 1, "lint"))
        .unwrap();
    clock.advance(Duration::days(3));
    let mid = f
        .manager
        .create(CheckpointRequest::success("standard", 2, "test"))
        .unwrap();
    clock.advance(Duration::days(5));
    let fresh = f
        .manager
        .create(CheckpointRequest::success("standard", 3, "build"))
        .unwrap();

    // now = start + 8 days: only `old` is past the 7-day window
    let report = f.manager.cleanup().unwrap();
    assert_eq!(report.removed_checkpoints, vec![old.id.clone()]);

    let remaining: Vec<_> = f.manager.list().unwrap().into_iter().map(|c| c.id).collect();
    assert_eq!(remaining, vec![fresh.id, mid.id]);
    assert!(matches!(
        f.manager.detail(&old.id),
        Err(CheckpointError::NotFound(_))
    ));
}

#[test]
fn ledger_survives_reopen() {
    let clock = TestClock::at(start());
    let f = fixture(clock.clone());
    let cp = f
        .manager
        .create(CheckpointRequest::success("light", 1, "fmt"))
        .unwrap();

    let store = Arc::new(FsCheckpointStore::open(f.storage.path(), "run-abc").unwrap());
    let settings = CheckpointSettings::new(f.workspace.path())
        .with_critical_files(["Cargo.toml", "Cargo.lock", ".laneway/state.json"]);
    let reopened = CheckpointManager::new(settings, store).with_clock(clock);

    assert_eq!(reopened.detail(&cp.id).unwrap(), cp);
    let next = reopened
        .create(CheckpointRequest::success("light", 2, "lint"))
        .unwrap();
    assert_eq!(next.sequence, cp.sequence + 1);
}
