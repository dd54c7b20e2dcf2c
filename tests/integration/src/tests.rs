//! Integration tests for cfgbuild
//!
//! These run real local processes through `sh`, with the build engine and
//! store query tools replaced by scripts.

use cfgbuild_core::diff::{self, Generation};
use cfgbuild_core::exec::{Executor, LocalExecutor, Output};
use cfgbuild_core::nix::NixCommand;
use cfgbuild_core::tui::{BuildReporter, CopyReporter};
use cfgbuild_core::Error;
use integration_tests::*;
use tokio_util::sync::CancellationToken;

const SYSTEM: &str = "/nix/store/zv6nf9rvq4k3wz6d9dc3ym4b7zy4c9ix-nixos-system-host-24.11";
const DRV: &str = "/nix/store/1ab2kl7x13xpq7x0zy8z8jq3y1r9d4ga-nixos-system-host-24.11.drv";

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

// ============================================================================
// Local Executor Tests
// ============================================================================

#[tokio::test]
async fn test_local_output() {
    let executor = LocalExecutor::new();
    let mut cmd = executor
        .command("sh", &sh("echo hello; echo ignored >&2"))
        .await
        .expect("Failed to create command");

    let out = cmd.output().await.expect("Command failed");
    assert_eq!(out, b"hello\n");
}

#[tokio::test]
async fn test_local_exit_status() {
    let executor = LocalExecutor::new();
    let mut cmd = executor.command("sh", &sh("exit 7")).await.unwrap();

    let err = cmd.run().await.unwrap_err();
    assert!(err.is_exit_status());
    assert_eq!(err.exit_code(), 7);
}

#[tokio::test]
async fn test_local_stdout_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let file = tokio::fs::File::create(&path).await.unwrap();

    let executor = LocalExecutor::new();
    let mut cmd = executor.command("sh", &sh("printf written")).await.unwrap();
    cmd.set_stdout(Output::Writer(Box::new(file)));
    cmd.run().await.expect("Command failed");

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "written");
}

#[tokio::test]
async fn test_local_path_exists() {
    let dir = tempfile::tempdir().unwrap();
    let executor = LocalExecutor::new();

    let present = dir.path().to_string_lossy().into_owned();
    let absent = dir.path().join("absent").to_string_lossy().into_owned();

    assert!(executor.path_exists(&present).await.unwrap());
    assert!(!executor.path_exists(&absent).await.unwrap());
}

// ============================================================================
// Build Engine Tests
// ============================================================================

#[tokio::test]
async fn test_build_with_reporter() {
    let tools = FakeTools::new().program("nix", &engine_script(&build_log(DRV), SYSTEM, 0));

    let out = NixCommand::new("build")
        .args(["-f", "nilla.nix", "systems.nixos.host"])
        .executor(tools.executor())
        .reporter(Box::new(BuildReporter::new(false, 30)))
        .run(CancellationToken::new())
        .await
        .expect("Build failed");

    assert_eq!(out, SYSTEM);
}

#[tokio::test]
async fn test_build_without_reporter() {
    let tools = FakeTools::new().program("nix", &engine_script(&[], SYSTEM, 0));

    let out = NixCommand::new("build")
        .executor(tools.executor())
        .run(CancellationToken::new())
        .await
        .expect("Build failed");

    assert_eq!(out, SYSTEM);
}

#[tokio::test]
async fn test_build_fatal_message() {
    let mut log = build_log(DRV);
    log.insert(
        2,
        log_line(serde_json::json!({
            "action": "msg",
            "level": 0,
            "msg": "error: builder for 'nixos-system-host-24.11.drv' failed",
        })),
    );
    let tools = FakeTools::new().program("nix", &engine_script(&log, "", 1));

    let err = NixCommand::new("build")
        .executor(tools.executor())
        .reporter(Box::new(BuildReporter::new(false, 30)))
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::BuildFailed(text) => assert!(text.contains("failed")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_build_survives_unstructured_stderr() {
    let mut log = vec!["warning: Git tree is dirty".to_string()];
    log.extend(build_log(DRV));
    let tools = FakeTools::new().program("nix", &engine_script(&log, SYSTEM, 0));

    let out = NixCommand::new("build")
        .executor(tools.executor())
        .reporter(Box::new(BuildReporter::new(true, 30)))
        .run(CancellationToken::new())
        .await
        .expect("Build failed");

    assert_eq!(out, SYSTEM);
}

#[tokio::test]
async fn test_build_exit_status_without_message() {
    let tools = FakeTools::new().program("nix", &engine_script(&build_log(DRV), "", 3));

    let err = NixCommand::new("build")
        .executor(tools.executor())
        .reporter(Box::new(BuildReporter::new(false, 30)))
        .run(CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_exit_status());
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn test_copy_with_reporter() {
    let log = vec![
        log_line(serde_json::json!({"action": "start", "id": 1, "type": 103, "parent": 0})),
        log_line(serde_json::json!({
            "action": "start", "id": 2, "type": 100, "parent": 1,
            "fields": [SYSTEM, "local", "ssh-ng://builder"],
        })),
        log_line(serde_json::json!({"action": "result", "id": 2, "type": 105, "fields": [512, 1024, 0, 0]})),
        log_line(serde_json::json!({"action": "stop", "id": 2})),
        log_line(serde_json::json!({"action": "result", "id": 1, "type": 105, "fields": [1, 1, 0, 0]})),
        log_line(serde_json::json!({"action": "stop", "id": 1})),
    ];
    let tools = FakeTools::new().program("nix", &engine_script(&log, "", 0));

    let out = NixCommand::new("copy")
        .args(["--to", "ssh-ng://builder", SYSTEM])
        .executor(tools.executor())
        .reporter(Box::new(CopyReporter::new(true, 30)))
        .run(CancellationToken::new())
        .await
        .expect("Copy failed");

    assert_eq!(out, "");
}

#[tokio::test]
async fn test_cancelled_build() {
    let tools = FakeTools::new().program("nix", "exec sleep 30\n");
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let err = NixCommand::new("build")
        .executor(tools.executor())
        .reporter(Box::new(BuildReporter::new(false, 30)))
        .run(token)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Signalled { .. }), "unexpected error: {}", err);
}

// ============================================================================
// Diff Tests
// ============================================================================

const STORE_QUERY: &str = r#"
case "$2" in
--references)
    case "$3" in
    */before/sw)
        echo /nix/store/nc394xps4al1r99ziabqvajbkrhxr5b7-gzip-1.13
        echo /nix/store/3bl0g75vyjgg8gnggwiavbwdxyg6gv20-gnutar-1.35
        ;;
    *)
        echo /nix/store/6pxd0l1s0zjy9gq6vbc8a2vx3rmf3dgm-gzip-1.14
        echo /nix/store/a5b2kl7x13xpq7x0zy8z8jq3y1r9d4ga-zlib-1.3.1
        ;;
    esac
    ;;
--requisites)
    echo /nix/store/i6fl7i35dacvxqpzya6h78nacciwryfh-glibc-2.40
    ;;
esac
"#;

const PATH_INFO: &str = r#"
case "$4" in
*/before) echo '[{"closureSize":1048576}]' ;;
*) echo "{\"$4\":{\"closureSize\":3145728}}" ;;
esac
"#;

#[tokio::test]
async fn test_diff_run_through_executor() {
    let tools = FakeTools::new()
        .program("nix-store", STORE_QUERY)
        .program("nix", PATH_INFO);

    let before = tools.dir().join("before");
    let after = tools.dir().join("after");
    std::fs::create_dir_all(before.join("sw")).unwrap();
    std::fs::create_dir_all(&after).unwrap();

    let executor = tools.executor();
    let from = Generation::new(before.to_string_lossy(), executor.as_ref());
    let to = Generation::new(after.to_string_lossy(), executor.as_ref());

    let (diff, closure) = diff::run(&from, &to, &CancellationToken::new())
        .await
        .expect("Diff failed");

    assert_eq!(diff.changed.len(), 1);
    assert_eq!(diff.changed[0].name, "gzip");
    assert_eq!(diff.changed[0].before, vec!["1.13"]);
    assert_eq!(diff.changed[0].after, vec!["1.14"]);
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].name, "zlib");
    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.removed[0].name, "gnutar");

    assert_eq!(closure.num_before, 3);
    assert_eq!(closure.num_after, 3);
    assert_eq!(closure.bytes_before, 1048576);
    assert_eq!(closure.bytes_after, 3145728);
    assert_eq!(
        diff::closure_summary(&closure),
        "Closure size: 3 -> 3 (disk usage +2.00MiB)"
    );
}

#[tokio::test]
async fn test_diff_execute_delegates_when_local() {
    let tools = FakeTools::new();
    let record = tools.dir().join("record.txt");
    let tools = tools.program(
        "nvd",
        &format!("echo \"$1 $2 $3\" > '{}'\n", record.display()),
    );

    let executor = tools.executor();
    let from = Generation::new("/run/current-system", executor.as_ref());
    let to = Generation::new(SYSTEM, executor.as_ref());

    diff::execute("nvd", &from, &to, &CancellationToken::new())
        .await
        .expect("Diff failed");

    let recorded = std::fs::read_to_string(&record).unwrap();
    assert_eq!(recorded.trim(), format!("diff /run/current-system {}", SYSTEM));
}

#[tokio::test]
async fn test_diff_execute_after_interrupt_runs_nothing() {
    let tools = FakeTools::new();
    let record = tools.dir().join("record.txt");
    let tools = tools.program("nvd", &format!("touch '{}'\n", record.display()));

    let token = CancellationToken::new();
    token.cancel();

    let executor = tools.executor();
    let from = Generation::new("/run/current-system", executor.as_ref());
    let to = Generation::new(SYSTEM, executor.as_ref());

    let err = diff::execute("nvd", &from, &to, &token).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled), "unexpected error: {}", err);
    assert!(!record.exists());
}

#[tokio::test]
async fn test_engine_not_started_after_interrupt() {
    let tools = FakeTools::new();
    let record = tools.dir().join("record.txt");
    let tools = tools.program("nix", &format!("touch '{}'\n", record.display()));

    let token = CancellationToken::new();
    token.cancel();

    let err = NixCommand::new("build")
        .executor(tools.executor())
        .run(token)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled), "unexpected error: {}", err);
    assert!(!record.exists());
}
