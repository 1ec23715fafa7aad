//! Shared helpers for integration tests.

#![allow(dead_code)]

#[path = "../../src/test_support/socket_guard.rs"]
pub mod socket_guard;

use std::path::{Path, PathBuf};

/// Writes an annotations manifest with inline `task-inputs` / `task-outputs`.
pub fn write_manifest(dir: &Path, inputs: Option<&str>, outputs: Option<&str>) -> PathBuf {
    let mut text = String::new();
    if let Some(inputs) = inputs {
        text.push_str(&format!("task-inputs={}\n", serde_json::to_string(inputs).unwrap()));
    }
    if let Some(outputs) = outputs {
        text.push_str(&format!("task-outputs={}\n", serde_json::to_string(outputs).unwrap()));
    }
    let path = dir.join("annotations");
    std::fs::write(&path, text).unwrap();
    path
}

/// Names of the completion markers in `dir`.
pub fn markers(dir: &Path) -> Vec<String> {
    let mut names = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".finish"))
        .collect::<Vec<_>>();
    names.sort();
    names
}
