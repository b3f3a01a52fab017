use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const SHEETBENCH_ROOT_MARKER: &str = "/sandbox";
pub const SHEETBENCH_SCRIPT_NAME: &str = "script.py";
pub const SHEETBENCH_DEFAULT_INTERPRETER: &str = "python3";
pub const SHEETBENCH_DEFAULT_TASK: &str = "banking";
pub const SHEETBENCH_DEFAULT_TASKS_DIR: &str = "tasks";
pub const SHEETBENCH_INSTANCE_PREFIX: &str = "sheetbench";

pub const TASK_MANIFEST_FILE: &str = "manifest.json";
pub const TASK_GRADER_FILE: &str = "grader.yaml";

pub const SHEETBENCH_ENV_TASKS_DIR: &str = "SHEETBENCH_TASKS_DIR";
pub const SHEETBENCH_ENV_TASK: &str = "SHEETBENCH_TASK";
pub const SHEETBENCH_ENV_INTERPRETER: &str = "SHEETBENCH_INTERPRETER";
pub const SHEETBENCH_ENV_ROOT_MARKER: &str = "SHEETBENCH_ROOT_MARKER";
pub const SHEETBENCH_ENV_WORKSPACE_PARENT: &str = "SHEETBENCH_WORKSPACE_PARENT";

/// Files in a task directory that are never staged into a workspace.
pub const TASK_PRIVATE_FILES: &[&str] = &[TASK_MANIFEST_FILE, TASK_GRADER_FILE];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathResolveError {
    #[error("path escapes the workspace root: {0}")]
    Escape(String),
}

fn strip_root_marker<'a>(path: &'a str, marker: &str) -> Option<&'a str> {
    let marker = marker.trim_end_matches('/');
    if marker.is_empty() {
        return None;
    }
    if path == marker {
        return Some("");
    }
    let rest = path.strip_prefix(marker)?;
    if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Maps a caller-facing path onto a path relative to the workspace root.
///
/// `<marker>/a/b`, `/a/b` and `a/b` all resolve to `a/b`. `.` segments are
/// dropped and `..` is applied lexically; climbing above the root is an error.
pub fn resolve_virtual_path(path: &str, root_marker: &str) -> Result<PathBuf, PathResolveError> {
    let rest = strip_root_marker(path, root_marker).unwrap_or(path);
    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathResolveError::Escape(path.to_string()));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.iter().collect())
}

/// Renders a root-relative path the way callers address it.
pub fn virtual_path_for(relative: &Path, root_marker: &str) -> String {
    let marker = root_marker.trim_end_matches('/');
    let rel = relative.to_string_lossy();
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        if marker.is_empty() {
            "/".to_string()
        } else {
            marker.to_string()
        }
    } else {
        format!("{}/{}", marker, rel)
    }
}

pub fn instance_name(seq: u64) -> String {
    format!(
        "{}-{}-{}-{}",
        SHEETBENCH_INSTANCE_PREFIX,
        std::process::id(),
        Utc::now().timestamp_micros(),
        seq
    )
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}
