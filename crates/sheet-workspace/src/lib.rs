//! Per-run workspace: a private directory plus the ability to run code in it.
//!
//! A workspace is *not* a security boundary. The local backend confines caller
//! paths to its root through [`sheet_core::resolve_virtual_path`], which stops
//! accidental escapes, but submitted code runs as an ordinary child process with
//! the harness's own privileges, network and filesystem view. Backends with real
//! isolation plug in behind the [`Workspace`] trait.

use serde::Serialize;
use sheet_core::{
    instance_name, resolve_virtual_path, virtual_path_for, PathResolveError,
    SHEETBENCH_DEFAULT_INTERPRETER, SHEETBENCH_ROOT_MARKER,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace is not running")]
    NotRunning,
    #[error("source not found: {0}")]
    SourceNotFound(String),
    #[error(transparent)]
    Path(#[from] PathResolveError),
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        WorkspaceError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Captured outcome of one code execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "returncode")]
    pub exit_code: i32,
}

impl ExecutionResult {
    fn from_output(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: exit_code_of(&output.status),
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Capability set every workspace backend provides.
///
/// Every path argument named `virtual_*` is caller-facing and goes through the
/// same resolver; every operation except `start`/`stop` fails with
/// [`WorkspaceError::NotRunning`] before touching anything when stopped.
pub trait Workspace: Send {
    fn name(&self) -> &str;
    fn root(&self) -> Option<&Path>;
    fn is_running(&self) -> bool;
    fn start(&mut self) -> Result<(), WorkspaceError>;
    fn stop(&mut self) -> Result<(), WorkspaceError>;
    /// Writes `code` to `entry_point` under the root and runs it to completion.
    /// No timeout is applied here.
    fn run(&self, code: &str, entry_point: &str) -> Result<ExecutionResult, WorkspaceError>;
    fn copy_in(&self, local_source: &Path, virtual_dest: &str) -> Result<(), WorkspaceError>;
    fn copy_out(&self, virtual_source: &str, local_dest: &Path) -> Result<(), WorkspaceError>;
    fn read(&self, virtual_path: &str) -> Result<String, WorkspaceError>;
    fn write(&self, virtual_path: &str, content: &str) -> Result<(), WorkspaceError>;
    /// Recursive listing; a missing target yields a "not found" text, not an error.
    fn list(&self, virtual_path: &str) -> Result<String, WorkspaceError>;
}

/// Plain-directory backend.
#[derive(Debug)]
pub struct LocalWorkspace {
    name: String,
    parent: PathBuf,
    interpreter: String,
    root_marker: String,
    root: Option<PathBuf>,
}

impl LocalWorkspace {
    pub fn new(parent: impl AsRef<Path>) -> Self {
        Self {
            name: String::new(),
            parent: parent.as_ref().to_path_buf(),
            interpreter: SHEETBENCH_DEFAULT_INTERPRETER.to_string(),
            root_marker: SHEETBENCH_ROOT_MARKER.to_string(),
            root: None,
        }
    }

    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir())
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_root_marker(mut self, root_marker: impl Into<String>) -> Self {
        self.root_marker = root_marker.into();
        self
    }

    pub fn root_marker(&self) -> &str {
        &self.root_marker
    }

    fn running_root(&self) -> Result<&Path, WorkspaceError> {
        self.root.as_deref().ok_or(WorkspaceError::NotRunning)
    }

    fn resolve(&self, virtual_path: &str) -> Result<PathBuf, WorkspaceError> {
        let root = self.running_root()?;
        let rel = resolve_virtual_path(virtual_path, &self.root_marker)?;
        Ok(root.join(rel))
    }

    fn virtual_for(&self, host_path: &Path) -> String {
        let rel = self
            .root
            .as_deref()
            .and_then(|root| host_path.strip_prefix(root).ok())
            .unwrap_or(host_path);
        virtual_path_for(rel, &self.root_marker)
    }

    fn allocate_root(&self) -> Result<(String, PathBuf), WorkspaceError> {
        fs::create_dir_all(&self.parent)
            .map_err(|e| WorkspaceError::io("create parent", &self.parent, e))?;
        loop {
            let name = instance_name(INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed));
            let path = self.parent.join(&name);
            match fs::create_dir(&path) {
                Ok(()) => return Ok((name, path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(WorkspaceError::io("create", &path, err)),
            }
        }
    }

    fn render_listing(&self, target: &Path) -> Result<String, WorkspaceError> {
        let mut blocks = Vec::new();
        for entry in walkdir::WalkDir::new(target).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(target).to_path_buf();
                WorkspaceError::Io {
                    op: "walk",
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk loop")),
                }
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let mut names = fs::read_dir(entry.path())
                .map_err(|e| WorkspaceError::io("list", entry.path(), e))?
                .filter_map(|child| child.ok())
                .map(|child| child.file_name().to_string_lossy().to_string())
                .collect::<Vec<_>>();
            names.sort();
            let mut block = format!("{}:\n", self.virtual_for(entry.path()));
            for name in names {
                block.push_str(&name);
                block.push('\n');
            }
            blocks.push(block);
        }
        Ok(blocks.join("\n"))
    }
}

impl Workspace for LocalWorkspace {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn is_running(&self) -> bool {
        self.root.is_some()
    }

    fn start(&mut self) -> Result<(), WorkspaceError> {
        if self.root.is_some() {
            return Ok(());
        }
        let (name, root) = self.allocate_root()?;
        tracing::info!(workspace = %name, root = %root.display(), "workspace started");
        self.name = name;
        self.root = Some(root);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), WorkspaceError> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };
        match fs::remove_dir_all(&root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                self.root = Some(root.clone());
                return Err(WorkspaceError::io("remove", &root, err));
            }
        }
        tracing::info!(workspace = %self.name, "workspace stopped");
        Ok(())
    }

    fn run(&self, code: &str, entry_point: &str) -> Result<ExecutionResult, WorkspaceError> {
        let root = self.running_root()?;
        let script = self.resolve(entry_point)?;
        if let Some(parent) = script.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::io("create", parent, e))?;
        }
        fs::write(&script, code).map_err(|e| WorkspaceError::io("write", &script, e))?;
        let script_arg = script
            .strip_prefix(root)
            .unwrap_or(&script)
            .to_string_lossy()
            .to_string();
        tracing::debug!(
            workspace = %self.name,
            interpreter = %self.interpreter,
            script = %script_arg,
            bytes = code.len(),
            "running code"
        );
        let output = Command::new(&self.interpreter)
            .arg(&script_arg)
            .current_dir(root)
            .output()
            .map_err(|source| WorkspaceError::Spawn {
                program: self.interpreter.clone(),
                source,
            })?;
        let result = ExecutionResult::from_output(output);
        tracing::debug!(workspace = %self.name, exit_code = result.exit_code, "code finished");
        Ok(result)
    }

    fn copy_in(&self, local_source: &Path, virtual_dest: &str) -> Result<(), WorkspaceError> {
        let dest = self.resolve(virtual_dest)?;
        if !local_source.is_file() {
            return Err(WorkspaceError::SourceNotFound(
                local_source.display().to_string(),
            ));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::io("create", parent, e))?;
        }
        fs::copy(local_source, &dest).map_err(|e| WorkspaceError::io("copy", &dest, e))?;
        tracing::debug!(workspace = %self.name, src = %local_source.display(), dest = %virtual_dest, "copied in");
        Ok(())
    }

    fn copy_out(&self, virtual_source: &str, local_dest: &Path) -> Result<(), WorkspaceError> {
        let source = self.resolve(virtual_source)?;
        if !source.is_file() {
            return Err(WorkspaceError::SourceNotFound(virtual_source.to_string()));
        }
        if let Some(parent) = local_dest.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::io("create", parent, e))?;
        }
        fs::copy(&source, local_dest).map_err(|e| WorkspaceError::io("copy", local_dest, e))?;
        tracing::debug!(workspace = %self.name, src = %virtual_source, dest = %local_dest.display(), "copied out");
        Ok(())
    }

    fn read(&self, virtual_path: &str) -> Result<String, WorkspaceError> {
        let path = self.resolve(virtual_path)?;
        if !path.is_file() {
            return Err(WorkspaceError::SourceNotFound(virtual_path.to_string()));
        }
        fs::read_to_string(&path).map_err(|e| WorkspaceError::io("read", &path, e))
    }

    fn write(&self, virtual_path: &str, content: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve(virtual_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::io("create", parent, e))?;
        }
        fs::write(&path, content).map_err(|e| WorkspaceError::io("write", &path, e))?;
        tracing::debug!(workspace = %self.name, path = %virtual_path, bytes = content.len(), "wrote file");
        Ok(())
    }

    fn list(&self, virtual_path: &str) -> Result<String, WorkspaceError> {
        let target = self.resolve(virtual_path)?;
        if !target.exists() {
            return Ok(format!("Directory not found: {}", virtual_path));
        }
        if target.is_file() {
            return Ok(format!("{}\n", self.virtual_for(&target)));
        }
        self.render_listing(&target)
    }
}

impl Drop for LocalWorkspace {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(workspace = %self.name, error = %err, "workspace cleanup failed");
        }
    }
}
