use flowrun::core::sandbox::{
    ProcessBackend, SandboxBackend, SandboxCommand, SandboxLimits, SandboxStatus,
};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Networking stays allowed so the tests do not depend on `unshare`. The
/// process cap counts every process of the user, so keep it generous.
fn limits() -> SandboxLimits {
    SandboxLimits {
        allow_network: true,
        max_processes: 4096,
        ..SandboxLimits::default()
    }
}

async fn backend(dir: &TempDir, output_limit: usize) -> ProcessBackend {
    let backend = ProcessBackend::new(dir.path().to_path_buf(), output_limit);
    backend.init(0).await.unwrap();
    backend
}

#[tokio::test]
async fn runs_command_in_scratch_dir() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 1024).await;
    std::fs::write(backend.scratch_dir(0).join("input.json"), "{\"n\":1}").unwrap();

    let outcome = backend
        .run(0, &SandboxCommand::new("cat input.json && echo && pwd", limits()))
        .await
        .unwrap();

    assert!(outcome.is_success());
    let lines: Vec<&str> = outcome.stdout.lines().collect();
    assert_eq!(lines[0], "{\"n\":1}");
    assert!(lines[1].ends_with("box-0"));
}

#[tokio::test]
async fn non_zero_exit_is_a_runtime_error() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 1024).await;

    let outcome = backend
        .run(0, &SandboxCommand::new("echo oops >&2; exit 3", limits()))
        .await
        .unwrap();

    assert_eq!(outcome.status, SandboxStatus::RuntimeError);
    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(outcome.log(), "oops");
}

#[tokio::test]
async fn environment_is_cleared_except_for_explicit_vars() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 1024).await;
    std::env::set_var("FLOWRUN_TEST_LEAK", "leaked");

    let command = SandboxCommand::new("echo \"[$FLOWRUN_TEST_LEAK][$STEP]\"", limits())
        .env("STEP", "total");
    let outcome = backend.run(0, &command).await.unwrap();
    std::env::remove_var("FLOWRUN_TEST_LEAK");

    assert_eq!(outcome.stdout.trim(), "[][total]");
}

#[tokio::test]
async fn wall_time_kills_the_process_group() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 1024).await;
    let scratch = backend.scratch_dir(0);

    let command = SandboxCommand::new(
        "(sleep 1; touch late.txt) & sleep 30",
        limits().with_wall_time(Duration::from_millis(200)),
    );
    let started = Instant::now();
    let outcome = backend.run(0, &command).await.unwrap();

    assert_eq!(outcome.status, SandboxStatus::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!scratch.join("late.txt").exists());
}

#[tokio::test]
async fn captured_output_is_truncated() {
    let dir = TempDir::new().unwrap();
    let backend = backend(&dir, 10).await;

    let outcome = backend
        .run(0, &SandboxCommand::new("printf abcdefghijklmnop", limits()))
        .await
        .unwrap();

    assert_eq!(outcome.stdout, "abcdefghij");
}

#[tokio::test]
async fn uninitialised_box_is_rejected_and_cleanup_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let backend = ProcessBackend::new(dir.path().to_path_buf(), 1024);

    let err = backend
        .run(3, &SandboxCommand::new("true", limits()))
        .await
        .unwrap_err();
    assert_eq!(err.code, "SBX-002");

    let scratch = backend.init(3).await.unwrap();
    std::fs::write(scratch.join("left.txt"), "x").unwrap();
    backend.cleanup(3).await.unwrap();
    assert!(!scratch.exists());
    backend.cleanup(3).await.unwrap();
}
