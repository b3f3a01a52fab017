use anyhow::{anyhow, Result};
use sheet_core::{TASK_GRADER_FILE, TASK_MANIFEST_FILE, TASK_PRIVATE_FILES};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory of tasks, one sub-directory per task name. Never written to.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    tasks_dir: PathBuf,
}

impl TaskRepository {
    pub fn new(tasks_dir: impl AsRef<Path>) -> Self {
        Self {
            tasks_dir: tasks_dir.as_ref().to_path_buf(),
        }
    }

    pub fn task(&self, name: &str) -> Result<TaskDescriptor> {
        let dir = self.tasks_dir.join(name);
        if !dir.is_dir() {
            return Err(anyhow!(
                "task {:?} not found under {}",
                name,
                self.tasks_dir.display()
            ));
        }
        Ok(TaskDescriptor {
            name: name.to_string(),
            dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    name: String,
    dir: PathBuf,
}

impl TaskDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(TASK_MANIFEST_FILE)
    }

    pub fn grader_path(&self) -> PathBuf {
        self.dir.join(TASK_GRADER_FILE)
    }

    pub fn has_grader(&self) -> bool {
        self.grader_path().is_file()
    }

    /// Raw manifest text; `None` when the task has no manifest.
    pub fn read_manifest(&self) -> Result<Option<String>> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Regular files handed to the agent, in name order. The manifest and the
    /// grading program are never included.
    pub fn starter_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if TASK_PRIVATE_FILES.contains(&name.as_str()) {
                continue;
            }
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
