#[path = "../support/mod.rs"]
mod support;

use flowrun::core::builder::{CodeBuilder, CodeSource};
use flowrun::core::config::BuilderConfig;
use flowrun::core::sandbox::SandboxBackend;
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{pool, ScriptedBackend, BUILD, INSTALL};
use tempfile::TempDir;

fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn setup(dir: &TempDir) -> (CodeBuilder, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    let builder = CodeBuilder::new(pool(&backend, 1), BuilderConfig::default());
    (builder, backend)
}

#[tokio::test]
async fn inline_source_is_installed_and_bundled() {
    let dir = TempDir::new().unwrap();
    let (builder, backend) = setup(&dir);
    let source = CodeSource::Inline {
        code: "exports.code = async (i) => i // echo".to_string(),
        package_json: json!({"dependencies": {"dayjs": "1.11.10"}}),
    };

    let artifact = builder.build(&source).await.unwrap();

    assert!(!artifact.fallback);
    assert_eq!(artifact.bytes, b"exports.code = async (i) => i // echo".to_vec());
    assert_eq!(artifact.fingerprint, source.fingerprint());
    assert!(artifact.build_log.starts_with("[install]\nadded 2 packages"));
    assert!(artifact.build_log.contains("[build]\nwebpack compiled successfully"));
    assert_eq!(
        backend.commands.lock().unwrap().as_slice(),
        &[INSTALL.to_string(), BUILD.to_string()]
    );

    let scratch = backend.scratch_dir(0);
    let manifest: Value =
        serde_json::from_str(&std::fs::read_to_string(scratch.join("package.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["dependencies"]["dayjs"], json!("1.11.10"));
    assert_eq!(manifest["scripts"]["build"], json!("webpack --config webpack.config.js"));
    assert!(manifest["devDependencies"]["webpack"].is_string());
    assert!(manifest["devDependencies"].get("ts-loader").is_none());
    let config = std::fs::read_to_string(scratch.join("webpack.config.js")).unwrap();
    assert!(config.contains("entry: './index.js'"));
}

#[tokio::test]
async fn typescript_archive_gets_ts_loader() {
    let dir = TempDir::new().unwrap();
    let (builder, backend) = setup(&dir);
    let bytes = zip_of(&[
        ("index.ts", "export const code = async (i: unknown) => i;"),
        ("index.js", "exports.code = async (i) => i // echo"),
        ("lib/util.ts", "export const x = 1;"),
        ("package.json", r#"{"name": "user-step", "scripts": {"build": "tsc"}}"#),
    ]);

    let artifact = builder.build(&CodeSource::Archive { bytes }).await.unwrap();
    assert!(!artifact.fallback);

    let scratch = backend.scratch_dir(0);
    assert!(scratch.join("lib/util.ts").is_file());
    let manifest: Value =
        serde_json::from_str(&std::fs::read_to_string(scratch.join("package.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["name"], json!("user-step"));
    assert_eq!(manifest["scripts"]["build"], json!("webpack --config webpack.config.js"));
    assert!(manifest["devDependencies"]["ts-loader"].is_string());
    assert!(manifest["devDependencies"]["typescript"].is_string());
    let config = std::fs::read_to_string(scratch.join("webpack.config.js")).unwrap();
    assert!(config.contains("entry: './index.ts'"));
    assert!(config.contains("ts-loader"));
}

#[tokio::test]
async fn failed_install_skips_build_and_yields_fallback() {
    let dir = TempDir::new().unwrap();
    let (builder, backend) = setup(&dir);
    backend.fail_install.store(true, Ordering::SeqCst);
    let source = CodeSource::Inline {
        code: "exports.code = async () => 1".to_string(),
        package_json: Value::Null,
    };

    let artifact = builder.build(&source).await.unwrap();

    assert!(artifact.fallback);
    assert_eq!(backend.builds.load(Ordering::SeqCst), 0);
    let text = String::from_utf8(artifact.bytes.clone()).unwrap();
    assert!(text.starts_with("exports.code = async () => { throw new Error("));
    let message = support::evaluate(&text, &Value::Null).unwrap_err();
    assert!(message.starts_with("Failed to build code step:\n[install]"));
    assert!(message.contains("npm ERR! 404 Not Found - left-pad-9000"));
    assert_eq!(builder.config().output_file, "dist/index.js");
}

#[tokio::test]
async fn missing_bundle_after_failed_build_yields_fallback() {
    let dir = TempDir::new().unwrap();
    let (builder, backend) = setup(&dir);
    backend.fail_build.store(true, Ordering::SeqCst);
    let source = CodeSource::Inline {
        code: "exports.code = async () => {".to_string(),
        package_json: Value::Null,
    };

    let artifact = builder.build(&source).await.unwrap();

    assert!(artifact.fallback);
    assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
    assert!(artifact.build_log.contains("Module parse failed"));
}

#[tokio::test]
async fn escaping_archive_entries_fail_the_build() {
    let dir = TempDir::new().unwrap();
    let (builder, backend) = setup(&dir);
    let bytes = zip_of(&[("../../etc/evil.js", "boom")]);

    let err = builder.build(&CodeSource::Archive { bytes }).await.unwrap_err();
    assert_eq!(err.code, "BLD-002");
    assert!(backend.commands.lock().unwrap().is_empty());

    let err = builder
        .build(&CodeSource::Archive {
            bytes: b"not a zip".to_vec(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code, "BLD-001");
}

#[tokio::test]
async fn box_is_released_after_every_build() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::new(dir.path()));
    let pool = pool(&backend, 1);
    let builder = CodeBuilder::new(pool.clone(), BuilderConfig::default());

    let source = CodeSource::Archive {
        bytes: b"broken".to_vec(),
    };
    assert!(builder.build(&source).await.is_err());
    assert_eq!(pool.available(), 1);

    let source = CodeSource::Inline {
        code: "exports.code = async () => 1".to_string(),
        package_json: Value::Null,
    };
    builder.build(&source).await.unwrap();
    assert_eq!(pool.available(), 1);
    assert_eq!(pool.stats().checkouts, 2);
}
