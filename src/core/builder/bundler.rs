//! Files generated into a box before the bundler runs.

use serde_json::{json, Map, Value};
use std::path::Path;

pub const WEBPACK_CONFIG_FILE: &str = "webpack.config.js";
pub const MANIFEST_FILE: &str = "package.json";
pub const BUILD_SCRIPT: &str = "webpack --config webpack.config.js";

const WEBPACK_VERSION: &str = "^5.90.0";
const WEBPACK_CLI_VERSION: &str = "^5.1.4";
const TS_LOADER_VERSION: &str = "^9.5.1";
const TYPESCRIPT_VERSION: &str = "^5.3.3";

/// Entry file for the bundle; TypeScript sources win when both exist.
pub fn detect_entry(dir: &Path) -> &'static str {
    if dir.join("index.ts").is_file() {
        "index.ts"
    } else {
        "index.js"
    }
}

/// Single entry, CommonJS library output, minified.
pub fn webpack_config(entry: &str, output_file: &str) -> String {
    let output = Path::new(output_file);
    let output_dir = output
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let output_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index.js".to_string());
    let ts_rule = if entry.ends_with(".ts") {
        "\n  module: {\n    rules: [{ test: /\\.ts$/, use: 'ts-loader', exclude: /node_modules/ }],\n  },\n  resolve: { extensions: ['.ts', '.js'] },"
    } else {
        ""
    };
    format!(
        r#"const path = require('path');

module.exports = {{
  target: 'node',
  mode: 'production',
  entry: './{entry}',
  output: {{
    path: path.resolve(__dirname, '{output_dir}'),
    filename: '{output_name}',
    library: {{ type: 'commonjs2' }},
  }},
  optimization: {{ minimize: true }},{ts_rule}
}};
"#
    )
}

/// Merge the build script and bundler dev dependencies into a user manifest.
pub fn prepare_manifest(manifest: &Value, typescript: bool) -> Value {
    let mut root = match manifest {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    root.entry("name").or_insert_with(|| json!("flow-code-step"));
    root.entry("version").or_insert_with(|| json!("1.0.0"));

    with_object(&mut root, "scripts", |scripts| {
        scripts.insert("build".to_string(), json!(BUILD_SCRIPT));
    });
    with_object(&mut root, "devDependencies", |dev| {
        dev.entry("webpack").or_insert_with(|| json!(WEBPACK_VERSION));
        dev.entry("webpack-cli").or_insert_with(|| json!(WEBPACK_CLI_VERSION));
        if typescript {
            dev.entry("ts-loader").or_insert_with(|| json!(TS_LOADER_VERSION));
            dev.entry("typescript").or_insert_with(|| json!(TYPESCRIPT_VERSION));
        }
    });
    Value::Object(root)
}

fn with_object(root: &mut Map<String, Value>, key: &str, edit: impl FnOnce(&mut Map<String, Value>)) {
    let mut map = match root.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    edit(&mut map);
    root.insert(key.to_string(), Value::Object(map));
}

/// Bundle that throws the build log when the step runs.
pub fn fallback_artifact(build_log: &str) -> Vec<u8> {
    let message = Value::String(format!("Failed to build code step:\n{}", build_log));
    format!(
        "exports.code = async () => {{ throw new Error({}); }};\n",
        message
    )
    .into_bytes()
}
