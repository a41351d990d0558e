//! Migration (client switch) integration tests
//!
//! A migration reconciles a source manifest (what is installed) and a
//! target manifest (what should be), renames directories, removes what the
//! source had and the target drops, and writes a completion marker last.

use hashsync_engine::{FsOperation, JobRequest, MarkerFile};
use hashsync_sync::DirectoryRename;
use hashsync_tests::{
    generate_test_data, list_files, manifest_of, url_of, MemoryFetcher, RecordingExecutor,
    TestDataPattern, TestEnv,
};
use hashsync_types::{Error, PipelineState};

fn blob(size: usize, seed: u64) -> Vec<u8> {
    generate_test_data(size, TestDataPattern::Realistic, seed)
}

struct Switch {
    data: Vec<u8>,
    old: Vec<u8>,
    shared: Vec<u8>,
    new: Vec<u8>,
}

impl Switch {
    fn new() -> Self {
        Self {
            data: blob(120, 1),
            old: blob(80, 2),
            shared: blob(60, 3),
            new: blob(90, 4),
        }
    }

    fn install(&self, env: &TestEnv) {
        env.write("Client/data.pak", &self.data);
        env.write("Client/old.pak", &self.old);
        env.write("Client/shared.bin", &self.shared);
        env.write("cfg/config.ini", b"[client]\nname=old\n");
    }

    fn source(&self) -> Vec<(&'static str, &[u8])> {
        vec![
            ("Client/data.pak", self.data.as_slice()),
            ("Client/old.pak", self.old.as_slice()),
            ("Client/shared.bin", self.shared.as_slice()),
        ]
    }

    fn target(&self) -> Vec<(&'static str, &[u8])> {
        vec![
            ("Game/data.pak", self.data.as_slice()),
            ("Game/moved/shared.bin", self.shared.as_slice()),
            ("Game/new.pak", self.new.as_slice()),
        ]
    }

    fn request(&self, env: &TestEnv) -> JobRequest {
        JobRequest::migrate(&env.root, manifest_of(&self.source()), manifest_of(&self.target()))
            .with_renames(vec![DirectoryRename::new("Client", "Game")])
            .with_marker(MarkerFile::new("cfg/config.ini", "[client]\nname=new\n"))
    }
}

#[tokio::test]
async fn test_client_switch_renames_removes_and_writes_marker() {
    let env = TestEnv::new();
    let switch = Switch::new();
    switch.install(&env);
    let fetcher = MemoryFetcher::serving(&switch.target());
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    let summary = pipeline.prepare(switch.request(&env)).await.unwrap();
    assert_eq!(summary.blobs_to_fetch, 1);
    assert_eq!(summary.bytes_to_fetch, 90);
    assert_eq!(summary.files_in_place, 1);
    assert_eq!(summary.files_to_remove, 2);
    assert_eq!(summary.files_to_harvest, 1);
    assert_eq!(summary.renames, 1);

    let stats = pipeline.start().await.unwrap();

    assert_eq!(pipeline.state(), PipelineState::Finished);
    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(fetcher.calls()[0].url, url_of("Game/new.pak"));
    assert_eq!(stats.files_removed, 2);
    assert_eq!(stats.directories_renamed, 1);
    assert_eq!(
        list_files(&env.root),
        vec![
            "Game/data.pak",
            "Game/moved/shared.bin",
            "Game/new.pak",
            "cfg/config.ini"
        ]
    );
    assert_eq!(env.read("Game/data.pak"), switch.data);
    assert_eq!(env.read("Game/moved/shared.bin"), switch.shared);
    assert_eq!(env.read("Game/new.pak"), switch.new);
    assert_eq!(env.read("cfg/config.ini"), b"[client]\nname=new\n");
}

#[tokio::test]
async fn test_switch_operations_run_deletes_then_renames_then_placements() {
    let env = TestEnv::new();
    let switch = Switch::new();
    switch.install(&env);
    let fetcher = MemoryFetcher::serving(&switch.target());
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    pipeline.run(switch.request(&env)).await.unwrap();

    let operations = executor.batches().remove(0);
    let rank = |op: &FsOperation| match op {
        FsOperation::Delete { .. } => 0,
        FsOperation::Rename { .. } => 1,
        FsOperation::CreateDir { .. } => 2,
        FsOperation::Copy { .. } | FsOperation::Move { .. } => 3,
    };
    let ranks: Vec<u8> = operations.iter().map(rank).collect();
    assert!(ranks.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", operations);
    assert!(ranks.contains(&1));
}

#[tokio::test]
async fn test_rename_with_both_folders_present_is_unsupported() {
    let env = TestEnv::new();
    let switch = Switch::new();
    switch.install(&env);
    env.write("Game/stray.txt", b"already here");
    let fetcher = MemoryFetcher::serving(&switch.target());
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    let result = pipeline.prepare(switch.request(&env)).await;

    assert!(matches!(result, Err(Error::Unsupported { .. })));
    assert_eq!(pipeline.state(), PipelineState::Unsupported);
    assert_eq!(fetcher.fetch_count(), 0);
    assert!(env.exists("Client/old.pak"));
}

#[tokio::test]
async fn test_rename_conflict_after_prepare_is_an_error() {
    let env = TestEnv::new();
    let switch = Switch::new();
    switch.install(&env);
    let fetcher = MemoryFetcher::serving(&switch.target());
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    pipeline.prepare(switch.request(&env)).await.unwrap();
    env.write("Game/stray.txt", b"appeared while pending");
    let result = pipeline.start().await;

    assert!(matches!(result, Err(Error::InvalidState { .. })));
    assert_eq!(pipeline.state(), PipelineState::Error);
    assert!(!executor
        .operations()
        .iter()
        .any(|op| matches!(op, FsOperation::Delete { .. } | FsOperation::Rename { .. })));
    assert!(env.exists("Client/old.pak"));
    assert!(env.exists("Game/stray.txt"));
    assert_eq!(env.read("cfg/config.ini"), b"[client]\nname=old\n");
}

#[tokio::test]
async fn test_corrupt_staged_blob_does_not_replace_local_copy() {
    let env = TestEnv::new();
    let content = blob(64, 5);
    env.write("old/a.bin", &content);
    std::fs::create_dir_all(&env.staging).unwrap();
    std::fs::write(env.staged_blob(&content), [0u8; 64]).unwrap();
    let source: &[(&str, &[u8])] = &[("old/a.bin", &content)];
    let target: &[(&str, &[u8])] = &[("new/a.bin", &content)];
    let fetcher = MemoryFetcher::new();
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    pipeline
        .run(JobRequest::migrate(&env.root, manifest_of(source), manifest_of(target)))
        .await
        .unwrap();

    assert_eq!(pipeline.state(), PipelineState::Finished);
    assert_eq!(fetcher.fetch_count(), 0);
    assert!(!env.exists("old/a.bin"));
    assert_eq!(env.read("new/a.bin"), content);
}

#[tokio::test]
async fn test_failed_switch_keeps_previous_marker() {
    let env = TestEnv::new();
    let switch = Switch::new();
    switch.install(&env);
    let fetcher = MemoryFetcher::serving(&switch.target());
    let executor = RecordingExecutor::failing(1);
    let pipeline = env.pipeline(&fetcher, &executor);

    let result = pipeline.run(switch.request(&env)).await;

    assert!(matches!(result, Err(Error::Elevation { .. })));
    assert_eq!(pipeline.state(), PipelineState::Error);
    assert_eq!(env.read("cfg/config.ini"), b"[client]\nname=old\n");
    assert!(env.exists("Client/old.pak"));
}

#[tokio::test]
async fn test_migration_without_source_is_rejected() {
    let env = TestEnv::new();
    let switch = Switch::new();
    let fetcher = MemoryFetcher::new();
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    let mut request = switch.request(&env);
    request.source = None;

    assert!(matches!(
        pipeline.prepare(request).await,
        Err(Error::Manifest { .. })
    ));
    assert_eq!(pipeline.state(), PipelineState::Error);
}

#[tokio::test]
async fn test_explicit_deletions_apply_to_plain_installs() {
    let env = TestEnv::new();
    env.write("bin/legacy.dll", b"old library");
    env.write("bin/unknown.dat", b"user data");
    let files: &[(&str, &[u8])] = &[("bin/app.exe", b"app")];
    let fetcher = MemoryFetcher::serving(files);
    let executor = RecordingExecutor::new();
    let pipeline = env.pipeline(&fetcher, &executor);

    let target = manifest_of(files).with_delete_files(vec!["bin/legacy.dll".to_string()]);
    let stats = pipeline
        .run(JobRequest::install(&env.root, target))
        .await
        .unwrap();

    assert_eq!(stats.files_removed, 1);
    assert!(!env.exists("bin/legacy.dll"));
    assert!(env.exists("bin/unknown.dat"));
    assert_eq!(env.read("bin/app.exe"), b"app");
}
