//! End-to-end reconciliation scenarios over a temp-dir sync root, the
//! in-memory remote backend, and the portable placeholder provider.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use stratus_cloudfilter::DirectoryFilter;
use stratus_core::types::{FileSyncState, FileSyncStatus, StateCallbacks};
use stratus_remote::{MemoryRemote, RemoteFs};
use stratus_sync::{start_projecting, VirtualizationInstance};

struct TestInstance {
    root: tempfile::TempDir,
    remote: MemoryRemote,
    filter: DirectoryFilter,
    instance: Option<VirtualizationInstance>,
}

impl TestInstance {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            remote: MemoryRemote::new(),
            filter: DirectoryFilter::new(),
            instance: None,
        }
    }

    async fn start(&mut self) {
        self.filter = DirectoryFilter::new();
        let instance = start_projecting(
            self.root.path(),
            Arc::new(self.remote.clone()),
            Arc::new(self.filter.clone()),
        )
        .await
        .unwrap();
        self.instance = Some(instance);
    }

    async fn stop(&mut self) {
        self.instance.take().unwrap().close().await.unwrap();
    }

    fn instance(&self) -> &VirtualizationInstance {
        self.instance.as_ref().unwrap()
    }

    async fn sync(&self) {
        self.instance().perform_synchronization().await.unwrap();
    }

    fn local_path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn write_local(&self, name: &str, content: &str) {
        std::fs::write(self.local_path(name), content).unwrap();
    }

    fn read_local(&self, name: &str) -> String {
        String::from_utf8(std::fs::read(self.local_path(name)).unwrap()).unwrap()
    }

    async fn read_remote(&self, path: &str) -> String {
        String::from_utf8(self.remote.read(path).await.unwrap()).unwrap()
    }

    async fn hydrate(&self, name: &str) {
        self.instance().hydrate(&self.local_path(name)).await.unwrap();
    }
}

fn secs_ago(secs: u64) -> SystemTime {
    SystemTime::now() - Duration::from_secs(secs)
}

fn secs_ahead(secs: u64) -> SystemTime {
    SystemTime::now() + Duration::from_secs(secs)
}

/// A file that exists on the backend before mount appears
/// locally and hydrates to the exact remote content.
#[tokio::test]
async fn existing_file_on_backend_downloads() {
    let mut t = TestInstance::new();
    t.remote.write("test.txt", b"something").await.unwrap();
    t.start().await;

    // materialized as a dehydrated placeholder by the initial sync
    let meta = std::fs::metadata(t.local_path("test.txt")).unwrap();
    assert_eq!(meta.len(), 0);

    t.hydrate("test.txt").await;
    assert_eq!(t.read_local("test.txt"), "something");

    // the full hydration refreshed the remote state cache
    let sidecar = t.remote.read(".md5_test.txt").await.unwrap();
    assert_eq!(sidecar, md5::compute(b"something").0.to_vec());
}

/// A new local file uploads on synchronization, together
/// with its hash sidecar.
#[tokio::test]
async fn new_local_file_uploads() {
    let mut t = TestInstance::new();
    t.start().await;

    t.write_local("test.txt", "something");
    t.sync().await;

    assert_eq!(t.read_remote("test.txt").await, "something");
    let sidecar = t.remote.read(".md5_test.txt").await.unwrap();
    assert_eq!(sidecar, md5::compute(b"something").0.to_vec());
}

/// With no intervening changes, a second synchronization
/// performs zero content reads and zero writes against the backend.
#[tokio::test]
async fn synchronization_is_idempotent() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;

    let before = t.remote.counters();
    t.sync().await;
    let after = t.remote.counters();
    assert_eq!(before, after, "second sync must not touch remote content");
}

/// Conflicting offline edits, the local one later — both
/// replicas converge on the local content.
#[tokio::test]
async fn conflict_local_newer_wins() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;
    t.stop().await;

    // remote changed first, local changed afterwards
    t.remote.write("test.txt", b"something3").await.unwrap();
    t.remote.set_mtime("test.txt", secs_ago(10)).unwrap();
    t.write_local("test.txt", "something2");

    // start runs the initial synchronization
    t.start().await;

    assert_eq!(t.read_remote("test.txt").await, "something2");
    assert_eq!(t.read_local("test.txt"), "something2");
}

/// Conflicting offline edits, the remote one later — both
/// replicas converge on the remote content.
#[tokio::test]
async fn conflict_remote_newer_wins() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;
    t.stop().await;

    // local changed first, remote changed afterwards
    t.write_local("test.txt", "something2");
    t.remote.write("test.txt", b"something3").await.unwrap();
    t.remote.set_mtime("test.txt", secs_ahead(10)).unwrap();

    t.start().await;
    t.sync().await;

    // the local copy was invalidated, not re-uploaded
    assert_eq!(t.read_remote("test.txt").await, "something3");
    t.hydrate("test.txt").await;
    assert_eq!(t.read_local("test.txt"), "something3");
}

/// A remote deletion propagates locally when the recorded
/// hash still matches the local content, and nothing is re-uploaded.
#[tokio::test]
async fn remote_deletion_propagates() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;

    t.remote.remove("test.txt").await.unwrap();
    let writes_before = t.remote.counters().content_writes;
    t.sync().await;

    assert!(!t.local_path("test.txt").exists(), "local copy should be gone");
    assert!(!t.remote.exists("test.txt").await.unwrap(), "no re-upload");
    assert_eq!(t.remote.counters().content_writes, writes_before);
}

/// A remote deletion racing a local edit is not a deletion: the changed
/// local content uploads as a new file.
#[tokio::test]
async fn remote_deletion_with_local_edit_reuploads() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;
    t.stop().await;

    t.remote.remove("test.txt").await.unwrap();
    t.write_local("test.txt", "edited while offline");

    // start runs the initial synchronization
    t.start().await;

    assert_eq!(t.read_remote("test.txt").await, "edited while offline");
    assert_eq!(t.read_local("test.txt"), "edited while offline");
}

/// The documented asymmetry — a local deletion while the
/// instance is stopped is not detected; the file is restored from the
/// remote copy instead.
#[tokio::test]
async fn local_deletion_while_offline_restores_file() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;
    t.stop().await;

    std::fs::remove_file(t.local_path("test.txt")).unwrap();

    t.start().await;
    t.sync().await;

    assert!(
        t.local_path("test.txt").exists(),
        "file should be restored locally"
    );
    assert!(
        t.remote.exists("test.txt").await.unwrap(),
        "remote copy must not be removed"
    );
}

/// A remote deletion that happened while the instance was stopped is still
/// detected on the next run, via the hash sidecar.
#[tokio::test]
async fn remote_deletion_while_offline_propagates() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;
    t.stop().await;

    t.remote.remove("test.txt").await.unwrap();

    t.start().await;
    t.sync().await;

    assert!(!t.local_path("test.txt").exists());
    assert!(!t.remote.exists("test.txt").await.unwrap());
}

/// A local deletion while the instance runs propagates to the remote via
/// the watcher.
#[tokio::test(flavor = "multi_thread")]
async fn local_deletion_while_running_propagates() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;
    assert!(t.remote.exists("test.txt").await.unwrap());

    std::fs::remove_file(t.local_path("test.txt")).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !t.remote.exists("test.txt").await.unwrap() {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "remote object was not removed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn remote_directory_materializes_locally() {
    let mut t = TestInstance::new();
    t.remote.create_dir_all("test").await.unwrap();
    t.start().await;

    assert!(std::fs::metadata(t.local_path("test")).unwrap().is_dir());
}

#[tokio::test]
async fn local_directory_mirrors_remotely() {
    let mut t = TestInstance::new();
    t.start().await;

    std::fs::create_dir(t.local_path("test")).unwrap();
    t.sync().await;

    let meta = t.remote.stat("test").await.unwrap();
    assert!(meta.is_dir);
}

#[tokio::test]
async fn nested_remote_tree_round_trips() {
    let mut t = TestInstance::new();
    t.remote.write("docs/sub/report.txt", b"deep").await.unwrap();
    t.start().await;

    t.hydrate("docs/sub/report.txt").await;
    assert_eq!(t.read_local("docs/sub/report.txt"), "deep");
}

/// Updating a file on the backend with a later timestamp invalidates the
/// local copy; content re-fetches on the next open.
#[tokio::test]
async fn remote_update_invalidates_local_copy() {
    let mut t = TestInstance::new();
    t.remote.write("test.txt", b"something").await.unwrap();
    t.remote.set_mtime("test.txt", secs_ago(30)).unwrap();
    t.start().await;
    t.hydrate("test.txt").await;
    assert_eq!(t.read_local("test.txt"), "something");

    t.remote.write("test.txt", b"somethingelse").await.unwrap();
    t.remote.set_mtime("test.txt", secs_ahead(10)).unwrap();
    t.sync().await;

    // dehydrated until the next open
    assert_eq!(std::fs::metadata(t.local_path("test.txt")).unwrap().len(), 0);
    t.hydrate("test.txt").await;
    assert_eq!(t.read_local("test.txt"), "somethingelse");
}

/// Hash sidecars and other hidden remote entries never materialize locally.
#[tokio::test]
async fn hidden_remote_entries_stay_remote() {
    let mut t = TestInstance::new();
    t.remote.write("test.txt", b"something").await.unwrap();
    t.remote.write(".hidden/secret.txt", b"x").await.unwrap();
    t.start().await;
    t.sync().await;

    assert!(t.local_path("test.txt").exists());
    assert!(!t.local_path(".md5_test.txt").exists());
    assert!(!t.local_path(".hidden").exists());
}

#[tokio::test]
async fn double_close_fails() {
    let mut t = TestInstance::new();
    t.start().await;
    let instance = t.instance.take().unwrap();

    instance.close().await.unwrap();
    let err = instance.close().await.unwrap_err();
    assert_eq!(err.to_string(), "not started");
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<FileSyncState>>,
}

impl StateCallbacks for Recorder {
    fn file_state(&self, state: FileSyncState) {
        self.states.lock().unwrap().push(state);
    }
}

/// Upload emits Uploading → Done for the file, in that order.
#[tokio::test]
async fn upload_emits_state_transitions() {
    let mut t = TestInstance::new();
    t.start().await;

    let recorder = Arc::new(Recorder::default());
    t.instance().set_state_callbacks(recorder.clone());

    t.write_local("test.txt", "something");
    t.sync().await;

    let states = recorder.states.lock().unwrap();
    let for_file: Vec<FileSyncStatus> = states
        .iter()
        .filter(|s| s.path == t.local_path("test.txt"))
        .map(|s| s.status)
        .collect();
    let uploading = for_file
        .iter()
        .position(|s| *s == FileSyncStatus::Uploading)
        .expect("Uploading state emitted");
    let done = for_file
        .iter()
        .position(|s| *s == FileSyncStatus::Done)
        .expect("Done state emitted");
    assert!(uploading < done);
}

/// Removing a file remotely emits a Deleted notification for the local path.
#[tokio::test]
async fn remote_deletion_emits_deleted_state() {
    let mut t = TestInstance::new();
    t.start().await;
    t.write_local("test.txt", "something");
    t.sync().await;

    let recorder = Arc::new(Recorder::default());
    t.instance().set_state_callbacks(recorder.clone());

    t.remote.remove("test.txt").await.unwrap();
    t.sync().await;

    let states = recorder.states.lock().unwrap();
    assert!(states
        .iter()
        .any(|s| s.path == t.local_path("test.txt") && s.status == FileSyncStatus::Deleted));
}

/// The provider-initiated hydration path (what an application open triggers
/// on the real OS) serves content through the registered fetch handler.
#[tokio::test(flavor = "multi_thread")]
async fn provider_requested_hydration_fills_placeholder() {
    let mut t = TestInstance::new();
    t.remote.write("test.txt", b"something").await.unwrap();
    t.start().await;

    let local = t.local_path("test.txt");
    let filter = t.filter.clone();
    tokio::task::spawn_blocking(move || filter.request_hydration(&local))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(t.read_local("test.txt"), "something");
}

/// A fetch for a file that vanished remotely surfaces an error and an
/// Error notification; nothing is written locally.
#[tokio::test]
async fn fetch_of_missing_remote_file_errors() {
    let mut t = TestInstance::new();
    t.remote.write("test.txt", b"something").await.unwrap();
    t.start().await;

    let recorder = Arc::new(Recorder::default());
    t.instance().set_state_callbacks(recorder.clone());

    // gone from the backend, placeholder still present locally
    t.remote.remove("test.txt").await.unwrap();
    let err = t.instance().hydrate(&t.local_path("test.txt")).await;
    assert!(err.is_err());

    let states = recorder.states.lock().unwrap();
    assert!(states
        .iter()
        .any(|s| s.path == t.local_path("test.txt") && s.status == FileSyncStatus::Error));
    assert_eq!(t.read_local("test.txt"), "");
}

/// Restarting over an existing root keeps the recorded sync-root identity.
#[tokio::test]
async fn identity_survives_restart() {
    let mut t = TestInstance::new();
    t.start().await;
    let id_bytes = std::fs::read(t.local_path(".virtualization")).unwrap();
    t.stop().await;

    t.start().await;
    assert_eq!(
        std::fs::read(t.local_path(".virtualization")).unwrap(),
        id_bytes
    );
}
