use crate::{grade_submission, GradeError, GradeVerdict};
use anyhow::{anyhow, Result};
use serde_json::Value;
use sheet_core::instance_name;
use sheet_schemas::{validate_against, GRADE_VERDICT_SCHEMA};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where a grading request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraderLaunch {
    /// `<program> <args..> --submission <file> --task-dir <dir>` in its own process.
    Subprocess { program: PathBuf, args: Vec<String> },
    /// Same checks on the calling thread.
    InProcess,
}

impl GraderLaunch {
    /// The running binary's own `grade` subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(GraderLaunch::Subprocess {
            program: std::env::current_exe()?,
            args: vec!["grade".to_string()],
        })
    }

    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("grader command must not be empty"))?;
        Ok(GraderLaunch::Subprocess {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }

    pub fn grade(&self, submission: &Path, task_dir: &Path) -> GradeVerdict {
        match self {
            GraderLaunch::InProcess => grade_submission(submission, task_dir),
            GraderLaunch::Subprocess { program, args } => {
                run_grader_process(program, args, submission, task_dir)
            }
        }
    }
}

fn run_grader_process(
    program: &Path,
    args: &[String],
    submission: &Path,
    task_dir: &Path,
) -> GradeVerdict {
    tracing::debug!(grader = %program.display(), submission = %submission.display(), "launching grader");
    let output = match Command::new(program)
        .args(args)
        .arg("--submission")
        .arg(submission)
        .arg("--task-dir")
        .arg(task_dir)
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            return GradeVerdict::error(format!(
                "Grading failed: could not start {}: {}",
                program.display(),
                err
            ))
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        tracing::warn!(status = %output.status, stderr = %stderr, "grader crashed");
        let verdict: GradeVerdict =
            GradeError::GraderCrashed(format!("exited with {}: {}", output.status, stderr)).into();
        return verdict.with_output(stdout);
    }
    match parse_verdict(&stdout) {
        Ok(verdict) => verdict,
        Err(err) => {
            let verdict: GradeVerdict =
                GradeError::GraderCrashed(format!("no verdict on stdout: {}", err)).into();
            verdict.with_output(stdout)
        }
    }
}

/// Parses the single JSON verdict a grader prints on stdout.
pub fn parse_verdict(stdout: &str) -> Result<GradeVerdict> {
    let value: Value = serde_json::from_str(stdout.trim())?;
    validate_against(GRADE_VERDICT_SCHEMA, &value)?;
    Ok(serde_json::from_value(value)?)
}

/// Private scratch directory removed when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent)?;
        loop {
            let path = parent.join(format!(
                "{}-grade",
                instance_name(SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed))
            ));
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "scratch cleanup failed");
        }
    }
}
