pub mod config;
pub mod rpc;
pub mod task;

use anyhow::Result;
use serde_json::{json, Value};
use sheet_core::virtual_path_for;
use sheet_grade::{GradeVerdict, GraderLaunch, ScratchDir};
use sheet_schemas::{load_schema, tool_schema_name, validate_against};
use sheet_workspace::{LocalWorkspace, Workspace};
use std::path::{Path, PathBuf};

pub use config::HarnessConfig;
pub use task::{TaskDescriptor, TaskRepository};

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
}

pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "get_manifest",
        description: "Returns the task manifest with instructions for the agent.",
    },
    ToolSpec {
        name: "get_task_files",
        description: "Copies the task's starter files into the workspace and returns their paths.",
    },
    ToolSpec {
        name: "run_python",
        description: "Runs Python code in the workspace and returns stdout, stderr and returncode.",
    },
    ToolSpec {
        name: "read_file",
        description: "Reads a text file from the workspace.",
    },
    ToolSpec {
        name: "write_file",
        description: "Writes a text file into the workspace.",
    },
    ToolSpec {
        name: "list_directory",
        description: "Recursively lists a workspace directory.",
    },
    ToolSpec {
        name: "grade",
        description: "Grades a submission file from the workspace against the task's expected output.",
    },
];

/// `{name, description, inputSchema}` for every tool, in declaration order.
pub fn tool_descriptors() -> Result<Vec<Value>> {
    TOOLS
        .iter()
        .map(|tool| {
            Ok(json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": load_schema(&tool_schema_name(tool.name))?,
            }))
        })
        .collect()
}

/// Text answer of one tool call. `is_error` marks calls that never reached a
/// tool (unknown name, bad arguments); tool-level failures live in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReply {
    pub text: String,
    pub is_error: bool,
}

impl ToolReply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    fn json(value: &Value) -> Self {
        Self::text(value.to_string())
    }

    fn rejected(message: String) -> Self {
        Self {
            text: json!({ "error": message }).to_string(),
            is_error: true,
        }
    }
}

/// One caller session: a started workspace bound to one task.
pub struct ToolDispatcher {
    workspace: Box<dyn Workspace>,
    task: TaskDescriptor,
    grader: GraderLaunch,
    root_marker: String,
    script_name: String,
    scratch_parent: PathBuf,
}

impl ToolDispatcher {
    /// Builds the local backend and grader launch described by `config`.
    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        let workspace = LocalWorkspace::new(config.workspace_parent())
            .with_interpreter(config.interpreter.clone())
            .with_root_marker(config.root_marker.clone());
        let grader = match &config.grader_command {
            Some(command) => GraderLaunch::from_command(command)?,
            None => GraderLaunch::current_exe()?,
        };
        let repo = TaskRepository::new(&config.tasks_dir);
        Self::open(config, Box::new(workspace), &repo, grader)
    }

    pub fn open(
        config: &HarnessConfig,
        mut workspace: Box<dyn Workspace>,
        repo: &TaskRepository,
        grader: GraderLaunch,
    ) -> Result<Self> {
        let task = repo.task(&config.task)?;
        workspace.start()?;
        tracing::info!(
            workspace = workspace.name(),
            task = task.name(),
            "workspace started"
        );
        Ok(Self {
            workspace,
            task,
            grader,
            root_marker: config.root_marker.clone(),
            script_name: config.script_name.clone(),
            scratch_parent: std::env::temp_dir(),
        })
    }

    pub fn with_scratch_parent(mut self, parent: impl AsRef<Path>) -> Self {
        self.scratch_parent = parent.as_ref().to_path_buf();
        self
    }

    pub fn workspace(&self) -> &dyn Workspace {
        self.workspace.as_ref()
    }

    pub fn task(&self) -> &TaskDescriptor {
        &self.task
    }

    pub fn close(mut self) -> Result<()> {
        self.workspace.stop()?;
        Ok(())
    }

    pub fn call(&self, name: &str, arguments: &Value) -> ToolReply {
        if !TOOLS.iter().any(|tool| tool.name == name) {
            tracing::warn!(tool = name, "unknown tool");
            return ToolReply::rejected(format!("unknown tool: {}", name));
        }
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments.clone()
        };
        if let Err(err) = validate_against(&tool_schema_name(name), &arguments) {
            return ToolReply::rejected(format!("invalid arguments for {}: {}", name, err));
        }
        tracing::debug!(tool = name, "tool call");
        let str_arg = |key: &str| arguments.get(key).and_then(Value::as_str).unwrap_or("");
        match name {
            "get_manifest" => ToolReply::text(self.get_manifest()),
            "get_task_files" => ToolReply::json(&self.get_task_files()),
            "run_python" => ToolReply::json(&self.run_python(str_arg("code"))),
            "read_file" => ToolReply::text(self.read_file(str_arg("path"))),
            "write_file" => ToolReply::text(self.write_file(str_arg("path"), str_arg("content"))),
            "list_directory" => {
                let path = arguments.get("path").and_then(Value::as_str).unwrap_or(".");
                ToolReply::text(self.list_directory(path))
            }
            _ => ToolReply::json(&self.grade(str_arg("submission_path")).to_value()),
        }
    }

    pub fn get_manifest(&self) -> String {
        match self.task.read_manifest() {
            Ok(Some(manifest)) => manifest,
            Ok(None) => json!({ "error": "Manifest not found" }).to_string(),
            Err(err) => json!({ "error": format!("Could not read manifest: {}", err) }).to_string(),
        }
    }

    pub fn get_task_files(&self) -> Value {
        let mut files = Vec::new();
        let starter = match self.task.starter_files() {
            Ok(starter) => starter,
            Err(err) => return json!({ "files": files, "error": err.to_string() }),
        };
        for local in starter {
            let Some(file_name) = local.file_name() else {
                continue;
            };
            let virtual_path = virtual_path_for(Path::new(file_name), &self.root_marker);
            if let Err(err) = self.workspace.copy_in(&local, &virtual_path) {
                tracing::warn!(file = %local.display(), error = %err, "staging failed");
                return json!({ "files": files, "error": err.to_string() });
            }
            files.push(virtual_path);
        }
        json!({ "files": files })
    }

    pub fn run_python(&self, code: &str) -> Value {
        match self.workspace.run(code, &self.script_name) {
            Ok(result) => json!(result),
            Err(err) => {
                let message = err.to_string();
                json!({
                    "stdout": "",
                    "stderr": message,
                    "returncode": -1,
                    "error": message,
                })
            }
        }
    }

    pub fn read_file(&self, path: &str) -> String {
        self.workspace
            .read(path)
            .unwrap_or_else(|err| format!("Error reading file: {}", err))
    }

    pub fn write_file(&self, path: &str, content: &str) -> String {
        match self.workspace.write(path, content) {
            Ok(()) => "Success".to_string(),
            Err(err) => format!("Error writing file: {}", err),
        }
    }

    pub fn list_directory(&self, path: &str) -> String {
        self.workspace
            .list(path)
            .unwrap_or_else(|err| format!("Error listing directory: {}", err))
    }

    pub fn grade(&self, submission_path: &str) -> GradeVerdict {
        if !self.task.has_grader() {
            return GradeVerdict::error("Grader not found");
        }
        let scratch = match ScratchDir::create(&self.scratch_parent) {
            Ok(scratch) => scratch,
            Err(err) => return GradeVerdict::error(format!("Grading failed: {}", err)),
        };
        let file_name = match Path::new(submission_path).extension() {
            Some(ext) => format!("submission.{}", ext.to_string_lossy()),
            None => "submission".to_string(),
        };
        let local = scratch.path().join(file_name);
        if let Err(err) = self.workspace.copy_out(submission_path, &local) {
            return GradeVerdict::error(format!("Could not retrieve submission: {}", err));
        }
        let verdict = self.grader.grade(&local, self.task.dir());
        tracing::info!(
            task = self.task.name(),
            submission = submission_path,
            status = verdict.status.as_str(),
            "graded"
        );
        verdict
    }
}

impl Drop for ToolDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.workspace.stop() {
            tracing::warn!(error = %err, "workspace release failed");
        }
    }
}
