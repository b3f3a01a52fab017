use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sheet_core::{
    SHEETBENCH_DEFAULT_INTERPRETER, SHEETBENCH_DEFAULT_TASK, SHEETBENCH_DEFAULT_TASKS_DIR,
    SHEETBENCH_ENV_INTERPRETER, SHEETBENCH_ENV_ROOT_MARKER, SHEETBENCH_ENV_TASK,
    SHEETBENCH_ENV_TASKS_DIR, SHEETBENCH_ENV_WORKSPACE_PARENT, SHEETBENCH_ROOT_MARKER,
    SHEETBENCH_SCRIPT_NAME,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Harness settings: YAML file, then `SHEETBENCH_*` environment, then CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub tasks_dir: PathBuf,
    pub task: String,
    pub interpreter: String,
    pub root_marker: String,
    pub script_name: String,
    pub workspace_parent: Option<PathBuf>,
    /// Program and leading arguments of the grading process. Defaults to this
    /// binary's `grade` subcommand.
    pub grader_command: Option<Vec<String>>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            tasks_dir: PathBuf::from(SHEETBENCH_DEFAULT_TASKS_DIR),
            task: SHEETBENCH_DEFAULT_TASK.to_string(),
            interpreter: SHEETBENCH_DEFAULT_INTERPRETER.to_string(),
            root_marker: SHEETBENCH_ROOT_MARKER.to_string(),
            script_name: SHEETBENCH_SCRIPT_NAME.to_string(),
            workspace_parent: None,
            grader_command: None,
        }
    }
}

impl HarnessConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `SHEETBENCH_*` overrides looked up through `lookup`; empty values
    /// are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = get(SHEETBENCH_ENV_TASKS_DIR) {
            self.tasks_dir = PathBuf::from(v);
        }
        if let Some(v) = get(SHEETBENCH_ENV_TASK) {
            self.task = v;
        }
        if let Some(v) = get(SHEETBENCH_ENV_INTERPRETER) {
            self.interpreter = v;
        }
        if let Some(v) = get(SHEETBENCH_ENV_ROOT_MARKER) {
            self.root_marker = v;
        }
        if let Some(v) = get(SHEETBENCH_ENV_WORKSPACE_PARENT) {
            self.workspace_parent = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.is_empty() || self.task.contains('/') || self.task == ".." {
            return Err(anyhow!("invalid task name: {:?}", self.task));
        }
        if self.interpreter.trim().is_empty() {
            return Err(anyhow!("interpreter must not be empty"));
        }
        if !self.root_marker.starts_with('/') || self.root_marker.trim_end_matches('/').is_empty() {
            return Err(anyhow!(
                "root_marker must be an absolute path other than '/': {:?}",
                self.root_marker
            ));
        }
        if self.script_name.is_empty() || self.script_name.contains("..") {
            return Err(anyhow!("invalid script_name: {:?}", self.script_name));
        }
        if let Some(command) = &self.grader_command {
            if command.is_empty() {
                return Err(anyhow!("grader_command must not be empty when set"));
            }
        }
        Ok(())
    }

    pub fn workspace_parent(&self) -> PathBuf {
        self.workspace_parent
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
