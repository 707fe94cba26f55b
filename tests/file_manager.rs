use std::{sync::Arc, time::Duration};

use cubehost::{
    error::ErrorKind,
    files::{
        FileManager, FilePolicy, FileType,
        archive::{ArchiveEntry, ArchiveFormat, Budget, EntryKind, decode, encode},
        safety::SIGNATURES,
    },
    runtime::mock::{ExecReply, MockRuntime, Op},
    store::{MemoryStore, Store},
    tasks::{GameKind, Server, ServerSpec, ServerStatus},
};
use rstest::rstest;
use uuid::Uuid;

const CONTAINER: &str = "mock-files";

struct Harness {
    runtime: Arc<MockRuntime>,
    files: FileManager,
    server_id: Uuid,
}

async fn harness_with(policy: FilePolicy) -> Harness {
    let runtime = Arc::new(MockRuntime::new());
    runtime.add_container(CONTAINER, true);
    runtime.with_dir("/data");

    let store = Arc::new(MemoryStore::new());
    let server_id = Uuid::new_v4();
    let mut server = Server::from_spec(
        server_id,
        ServerSpec {
            name: "creative".to_string(),
            image: "itzg/minecraft-server".to_string(),
            game: GameKind::Minecraft,
            memory_cap_mb: 1024,
            cpu_shares: 1024,
            ports: Vec::new(),
            env: Default::default(),
        },
        "/srv/cubehost/creative".into(),
    );
    server.status = ServerStatus::Running;
    server.container_ref = Some(CONTAINER.to_string());
    store.save_server(&server).await.unwrap();

    let files = FileManager::new(runtime.clone(), store, policy);
    Harness {
        runtime,
        files,
        server_id,
    }
}

async fn harness() -> Harness {
    harness_with(FilePolicy::default()).await
}

fn eicar_payload() -> Vec<u8> {
    let mut content = b"plugin-loader v2\n".to_vec();
    content.extend_from_slice(SIGNATURES[0].pattern);
    content
}

#[rstest]
#[case("../../etc/passwd")]
#[case("/data/../../../root/.ssh/authorized_keys")]
#[case("data\\..\\..\\etc\\shadow")]
#[tokio::test]
async fn traversal_never_reaches_the_runtime(#[case] path: &str) {
    let h = harness().await;

    let write = h.files.write_file(h.server_id, path, b"pwned").await;
    assert_eq!(write.unwrap_err().kind(), ErrorKind::PathTraversal);
    let read = h.files.read_file(h.server_id, path).await;
    assert_eq!(read.unwrap_err().kind(), ErrorKind::PathTraversal);
    let delete = h.files.delete_file(h.server_id, path).await;
    assert_eq!(delete.unwrap_err().kind(), ErrorKind::PathTraversal);
    let list = h.files.list_files(h.server_id, path).await;
    assert_eq!(list.unwrap_err().kind(), ErrorKind::PathTraversal);

    assert!(h.runtime.calls().is_empty());
}

#[tokio::test]
async fn malicious_content_is_never_uploaded() {
    let h = harness().await;
    let err = h
        .files
        .write_file(h.server_id, "/data/plugins/loader.jar", &eicar_payload())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityThreat);
    assert_eq!(h.runtime.count(Op::PutArchive), 0);
}

#[tokio::test]
async fn write_limit_is_inclusive() {
    let h = harness_with(FilePolicy {
        max_write_bytes: 16,
        ..FilePolicy::default()
    })
    .await;

    h.files
        .write_file(h.server_id, "/data/exact.txt", &[b'a'; 16])
        .await
        .unwrap();
    assert_eq!(h.runtime.file("/data/exact.txt").unwrap().len(), 16);

    let err = h
        .files
        .write_file(h.server_id, "/data/over.txt", &[b'a'; 17])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
    assert_eq!(h.runtime.count(Op::PutArchive), 1);
}

#[tokio::test]
async fn write_then_read_back() {
    let h = harness().await;
    h.files
        .write_file(h.server_id, "data/server.properties", b"motd=Welcome\n")
        .await
        .unwrap();
    let content = h
        .files
        .read_file(h.server_id, "/data/server.properties")
        .await
        .unwrap();
    assert_eq!(content, b"motd=Welcome\n");
}

#[tokio::test]
async fn write_into_missing_directory_is_not_found() {
    let h = harness().await;
    let err = h
        .files
        .write_file(h.server_id, "/data/nowhere/x.txt", b"x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reading_a_missing_file_is_not_found() {
    let h = harness().await;
    let err = h
        .files
        .read_file(h.server_id, "/data/missing.log")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn listing_keeps_names_with_spaces() {
    let h = harness().await;
    h.runtime.on_exec(
        "ls",
        ExecReply::stdout(
            "total 12\n\
             drwxr-xr-x 3 mc mc 4096 2024-06-01 10:00 .\n\
             drwxr-xr-x 1 mc mc 4096 2024-06-01 09:00 ..\n\
             -rw-r--r-- 1 mc mc 2048 2024-06-02 18:45 my world backup.zip\n\
             drwxr-xr-x 2 mc mc 4096 2024-06-03 07:30 plugins\n",
        ),
    );

    let files = h.files.list_files(h.server_id, "/data").await.unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "my world backup.zip");
    assert_eq!(files[0].absolute_path, "/data/my world backup.zip");
    assert_eq!(files[0].size_bytes, 2048);
    assert_eq!(files[1].file_type, FileType::Directory);
}

#[tokio::test]
async fn empty_directory_lists_nothing() {
    let h = harness().await;
    h.runtime.on_exec("ls", ExecReply::stdout("total 0\n"));
    assert!(h.files.list_files(h.server_id, "/data").await.unwrap().is_empty());
}

#[rstest]
#[case("ls: cannot access '/data/nope': No such file or directory", ErrorKind::NotFound)]
#[case("ls: cannot open directory '/root': Permission denied", ErrorKind::PermissionDenied)]
#[case("ls: unexpected failure", ErrorKind::Unknown)]
#[tokio::test]
async fn listing_errors_are_classified(#[case] stderr: &str, #[case] kind: ErrorKind) {
    let h = harness().await;
    h.runtime.on_exec("ls", ExecReply::stderr(stderr));
    let err = h.files.list_files(h.server_id, "/data/nope").await.unwrap_err();
    assert_eq!(err.kind(), kind);
}

#[tokio::test(start_paused = true)]
async fn stalled_exec_times_out() {
    let h = harness_with(FilePolicy {
        exec_timeout: Duration::from_secs(5),
        ..FilePolicy::default()
    })
    .await;
    h.runtime.hang(Op::Exec);

    let err = h.files.list_files(h.server_id, "/data").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let h = harness().await;
    h.runtime.with_file("/data/logs/old.log", b"...");

    h.files.delete_file(h.server_id, "/data/logs/old.log").await.unwrap();
    assert!(h.runtime.file("/data/logs/old.log").is_none());
    h.files.delete_file(h.server_id, "/data/logs/old.log").await.unwrap();

    h.runtime.on_exec(
        "rm",
        ExecReply::stderr("rm: cannot remove '/data/x': No such file or directory"),
    );
    h.files.delete_file(h.server_id, "/data/x").await.unwrap();
}

#[rstest]
#[case("/data/server.jar")]
#[case("/data/WORLD")]
#[case("/")]
#[tokio::test]
async fn protected_paths_are_refused(#[case] path: &str) {
    let h = harness().await;
    let err = h.files.delete_file(h.server_id, path).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtectedFile);
    assert!(h.runtime.calls().is_empty());
}

#[tokio::test]
async fn overwriting_a_protected_file_is_refused() {
    let h = harness().await;
    let err = h
        .files
        .write_file(h.server_id, "/data/level.dat", b"corrupt")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtectedFile);
    assert_eq!(h.runtime.count(Op::PutArchive), 0);
}

#[tokio::test]
async fn directories_are_created_recursively() {
    let h = harness().await;
    h.files
        .create_directory(h.server_id, "/data/plugins/Essentials")
        .await
        .unwrap();
    assert!(h.runtime.is_dir("/data/plugins/Essentials"));
}

#[tokio::test]
async fn download_returns_file_bytes_or_directory_tar() {
    let h = harness().await;
    h.runtime.with_file("/data/plugins/a.yml", b"a: 1\n");

    let file = h
        .files
        .download_file(h.server_id, "/data/plugins/a.yml")
        .await
        .unwrap();
    assert!(!file.archive);
    assert_eq!(file.name, "a.yml");
    assert_eq!(file.content, b"a: 1\n");

    let dir = h.files.download_file(h.server_id, "/data/plugins").await.unwrap();
    assert!(dir.archive);
    assert_eq!(dir.name, "plugins.tar");
    let entries = decode(&dir.content, &mut Budget::new(1024)).unwrap();
    assert!(entries.iter().any(|e| e.path == "plugins/a.yml"));
}

#[tokio::test]
async fn upload_rejects_names_with_separators() {
    let h = harness().await;
    for name in ["../evil.sh", "a/b.txt", "..", ""] {
        let err = h
            .files
            .upload_file(h.server_id, "/data", name, b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathTraversal, "{name}");
    }

    let path = h
        .files
        .upload_file(h.server_id, "/data", "ops.json", b"[]")
        .await
        .unwrap();
    assert_eq!(path, "/data/ops.json");
    assert_eq!(h.runtime.file("/data/ops.json").unwrap(), b"[]");
}

fn entry(path: &str, kind: EntryKind) -> ArchiveEntry {
    ArchiveEntry {
        path: path.to_string(),
        kind,
    }
}

#[tokio::test]
async fn extract_recreates_archive_tree() {
    let h = harness().await;
    let zip = encode(
        ArchiveFormat::Zip,
        &[
            entry("plugins", EntryKind::Directory),
            entry("plugins/a.yml", EntryKind::File(b"a: 1\n".to_vec())),
            entry("readme.txt", EntryKind::File(b"hello".to_vec())),
        ],
    )
    .unwrap();
    h.runtime.with_file("/data/pack.zip", &zip);

    let report = h
        .files
        .extract_archive(h.server_id, "/data/pack.zip", "/data/pack")
        .await
        .unwrap();
    assert_eq!(report.files, 2);
    assert_eq!(report.directories, 1);
    assert_eq!(report.bytes, 10);
    assert_eq!(h.runtime.file("/data/pack/plugins/a.yml").unwrap(), b"a: 1\n");
    assert_eq!(h.runtime.file("/data/pack/readme.txt").unwrap(), b"hello");
}

#[tokio::test]
async fn archive_bomb_is_stopped_before_any_write() {
    let h = harness_with(FilePolicy {
        max_archive_bytes: 1024,
        ..FilePolicy::default()
    })
    .await;
    let bomb = encode(
        ArchiveFormat::TarGz,
        &[
            entry("a.bin", EntryKind::File(vec![0; 800])),
            entry("b.bin", EntryKind::File(vec![0; 800])),
        ],
    )
    .unwrap();
    h.runtime.with_file("/data/bomb.tar.gz", &bomb);

    let err = h
        .files
        .extract_archive(h.server_id, "/data/bomb.tar.gz", "/data/out")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveTooLarge);
    assert_eq!(h.runtime.count(Op::PutArchive), 0);
    assert_eq!(h.runtime.count(Op::Exec), 0);
}

#[tokio::test]
async fn extract_refuses_archives_carrying_threats() {
    let h = harness().await;
    let archive = encode(
        ArchiveFormat::Tar,
        &[
            entry("clean.txt", EntryKind::File(b"fine".to_vec())),
            entry("dropper.bin", EntryKind::File(eicar_payload())),
        ],
    )
    .unwrap();
    h.runtime.with_file("/data/mods.tar", &archive);

    let err = h
        .files
        .extract_archive(h.server_id, "/data/mods.tar", "/data/mods")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityThreat);
    assert_eq!(h.runtime.count(Op::PutArchive), 0);
    assert!(h.runtime.file("/data/mods/clean.txt").is_none());
}

#[tokio::test]
async fn compress_bundles_sources_by_extension() {
    let h = harness().await;
    h.runtime.with_file("/data/plugins/a.yml", b"a: 1\n");
    h.runtime.with_file("/data/server.properties", b"motd=hi\n");

    let sources = vec![
        "/data/plugins".to_string(),
        "/data/server.properties".to_string(),
    ];
    let size = h
        .files
        .compress_archive(h.server_id, &sources, "/data/backup.tar.gz")
        .await
        .unwrap();

    let written = h.runtime.file("/data/backup.tar.gz").unwrap();
    assert_eq!(written.len() as u64, size);
    assert_eq!(ArchiveFormat::sniff(&written), ArchiveFormat::TarGz);
    let entries = decode(&written, &mut Budget::new(1 << 20)).unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"plugins/a.yml"));
    assert!(paths.contains(&"server.properties"));
}

#[tokio::test]
async fn compress_requires_a_known_extension() {
    let h = harness().await;
    let err = h
        .files
        .compress_archive(h.server_id, &["/data".to_string()], "/data/backup.rar")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(h.runtime.calls().is_empty());
}

#[tokio::test]
async fn server_without_container_is_not_found() {
    let runtime = Arc::new(MockRuntime::new());
    let store = Arc::new(MemoryStore::new());
    let files = FileManager::new(runtime.clone(), store, FilePolicy::default());
    let err = files.list_files(Uuid::new_v4(), "/data").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(runtime.calls().is_empty());
}
