use flowrun::core::config::loader::CONFIG_FILE_NAME;
use flowrun::core::config::{ConfigLoader, SandboxBackendKind};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

fn clear_flowrun_env() {
    for v in &[
        "FLOWRUN_SANDBOX_BACKEND",
        "FLOWRUN_SANDBOX_POOL_SIZE",
        "FLOWRUN_SANDBOX_BASE_DIR",
        "FLOWRUN_SANDBOX_ALLOW_NETWORK",
        "FLOWRUN_BUILDER_INSTALL_COMMAND",
        "FLOWRUN_BUILDER_BUILD_COMMAND",
        "FLOWRUN_CODE_RUNTIME_COMMAND",
        "FLOWRUN_RUN_MAX_TIME_SECONDS",
        "FLOWRUN_JOBS_CONCURRENCY",
    ] {
        env::remove_var(v);
    }
}

#[test]
#[serial]
fn test_defaults_without_config_file() {
    clear_flowrun_env();
    let temp_dir = TempDir::new().unwrap();

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();

    assert_eq!(config.sandbox.backend, SandboxBackendKind::Process);
    assert_eq!(config.sandbox.pool_size, 20);
    assert_eq!(config.builder.output_file, "dist/index.js");
    assert_eq!(config.code.runtime_command, "node run.js");
    assert_eq!(config.run.max_time_seconds, 600);
    assert!(config.run.redact_keys.contains(&"password".to_string()));
    assert_eq!(config.jobs.concurrency, 4);
}

#[test]
#[serial]
fn test_config_loading_integration() {
    clear_flowrun_env();
    let temp_dir = TempDir::new().unwrap();
    let workspace_path = temp_dir.path();

    let config_content = r#"
[sandbox]
backend = "isolate"
pool_size = 4
isolate_binary = "/usr/local/bin/isolate"
wall_time_seconds = 10

[builder]
install_command = "npm ci"
output_file = "build/bundle.js"

[code]
timeout_seconds = 5

[run]
max_time_seconds = 30
persist_runs = true
redact_keys = ["apiKey"]

[jobs]
poll_interval_ms = 250
max_attempts = 3
"#;
    fs::write(workspace_path.join(CONFIG_FILE_NAME), config_content).unwrap();

    let config = ConfigLoader::load_from_workspace(workspace_path).unwrap();

    assert_eq!(config.sandbox.backend, SandboxBackendKind::Isolate);
    assert_eq!(config.sandbox.pool_size, 4);
    assert_eq!(config.sandbox.isolate_binary, "/usr/local/bin/isolate");
    assert_eq!(config.sandbox.wall_time_seconds, 10);
    assert_eq!(config.builder.install_command, "npm ci");
    assert_eq!(config.builder.output_file, "build/bundle.js");
    assert_eq!(config.builder.build_command, "npm run build");
    assert_eq!(config.code.timeout_seconds, 5);
    assert_eq!(config.run.max_time_seconds, 30);
    assert!(config.run.persist_runs);
    assert_eq!(config.run.redact_keys, vec!["apiKey".to_string()]);
    assert_eq!(config.jobs.poll_interval_ms, 250);
    assert_eq!(config.jobs.max_attempts, 3);
    assert_eq!(config.jobs.concurrency, 4);
}

#[test]
#[serial]
fn test_env_overrides_take_precedence() {
    clear_flowrun_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join(CONFIG_FILE_NAME),
        "[sandbox]\npool_size = 4\n\n[run]\nmax_time_seconds = 30\n",
    )
    .unwrap();

    env::set_var("FLOWRUN_SANDBOX_POOL_SIZE", "8");
    env::set_var("FLOWRUN_SANDBOX_BACKEND", "isolate");
    env::set_var("FLOWRUN_RUN_MAX_TIME_SECONDS", "90");
    env::set_var("FLOWRUN_CODE_RUNTIME_COMMAND", "node --no-warnings run.js");
    env::set_var("FLOWRUN_JOBS_CONCURRENCY", "not-a-number");

    let config = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap();
    clear_flowrun_env();

    assert_eq!(config.sandbox.pool_size, 8);
    assert_eq!(config.sandbox.backend, SandboxBackendKind::Isolate);
    assert_eq!(config.run.max_time_seconds, 90);
    assert_eq!(config.code.runtime_command, "node --no-warnings run.js");
    assert_eq!(config.jobs.concurrency, 4);
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    clear_flowrun_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join(CONFIG_FILE_NAME),
        "[sandbox]\npool_size = 0\n",
    )
    .unwrap();

    let err = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap_err();
    assert_eq!(err.code, "CFG-003");
}

#[test]
#[serial]
fn test_malformed_toml_is_a_parse_error() {
    clear_flowrun_env();
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(CONFIG_FILE_NAME), "[sandbox\npool_size = ").unwrap();

    let err = ConfigLoader::load_from_workspace(temp_dir.path()).unwrap_err();
    assert_eq!(err.code, "CFG-002");
}
