use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use sheet_grade::grade_submission;
use sheet_tools::rpc::{serve_stdio, HttpRpcServer};
use sheet_tools::{tool_descriptors, HarnessConfig, ToolDispatcher};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sheetbench",
    version,
    about = "Spreadsheet task harness: workspace tools over JSON-RPC and a grader"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct HarnessArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    tasks_dir: Option<PathBuf>,
    #[arg(long)]
    task: Option<String>,
    #[arg(long)]
    interpreter: Option<String>,
}

impl HarnessArgs {
    fn resolve(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::load(self.config.as_deref())?;
        if let Some(tasks_dir) = &self.tasks_dir {
            config.tasks_dir = tasks_dir.clone();
        }
        if let Some(task) = &self.task {
            config.task = task.clone();
        }
        if let Some(interpreter) = &self.interpreter {
            config.interpreter = interpreter.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the workspace tools as JSON-RPC on stdio, or on HTTP with --http.
    Serve {
        #[command(flatten)]
        harness: HarnessArgs,
        #[arg(long)]
        http: Option<String>,
    },
    /// Grade one submission and print the verdict.
    Grade {
        #[arg(long)]
        submission: PathBuf,
        #[arg(long)]
        task_dir: PathBuf,
    },
    /// Print the tool descriptors.
    Tools,
    /// Run a solution script through the tools and grade what it produced.
    Check {
        #[command(flatten)]
        harness: HarnessArgs,
        #[arg(long)]
        solution: PathBuf,
        #[arg(long)]
        submission: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries RPC replies and verdicts.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Serve { harness, http } => {
            let config = harness.resolve()?;
            serve(&config, http.as_deref())?;
            Ok(None)
        }
        Commands::Grade {
            submission,
            task_dir,
        } => {
            let verdict = grade_submission(&submission, &task_dir);
            Ok(Some(verdict.to_value()))
        }
        Commands::Tools => Ok(Some(json!({
            "ok": true,
            "command": "tools",
            "tools": tool_descriptors()?,
        }))),
        Commands::Check {
            harness,
            solution,
            submission,
            json,
        } => {
            let config = harness.resolve()?;
            let report = run_check(&config, &solution, submission.as_deref())?;
            let passed = report["ok"].as_bool().unwrap_or(false);
            if json {
                emit_json(&report);
            } else {
                print_check_summary(&report);
            }
            if !passed {
                std::process::exit(1);
            }
            Ok(None)
        }
    }
}

fn serve(config: &HarnessConfig, http: Option<&str>) -> Result<()> {
    let dispatcher = ToolDispatcher::from_config(config)?;
    install_interrupt_cleanup(dispatcher.workspace().root())?;
    match http {
        Some(addr) => {
            let server = HttpRpcServer::bind(addr)?;
            eprintln!("sheetbench listening on {}", server.endpoint);
            server.serve(&dispatcher)?;
        }
        None => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            serve_stdio(&dispatcher, stdin.lock(), stdout.lock())?;
        }
    }
    dispatcher.close()
}

/// Ctrl-C skips destructors, so the handler removes the live root itself.
fn install_interrupt_cleanup(root: Option<&Path>) -> Result<()> {
    let root = root.map(Path::to_path_buf);
    ctrlc::set_handler(move || {
        if let Some(root) = &root {
            if let Err(err) = std::fs::remove_dir_all(root) {
                tracing::warn!(root = %root.display(), error = %err, "interrupt cleanup failed");
            }
        }
        std::process::exit(130);
    })
    .map_err(|e| anyhow!("failed to install interrupt handler: {}", e))
}

fn run_check(config: &HarnessConfig, solution: &Path, submission: Option<&str>) -> Result<Value> {
    let code = std::fs::read_to_string(solution)
        .map_err(|e| anyhow!("failed to read solution {}: {}", solution.display(), e))?;
    let submission = submission
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}/solutions/solution.csv", config.root_marker));

    let dispatcher = ToolDispatcher::from_config(config)?;
    let manifest = dispatcher.get_manifest();
    let files = dispatcher.get_task_files();
    let run = dispatcher.run_python(&code);
    let verdict = dispatcher.grade(&submission);
    dispatcher.close()?;

    let manifest = serde_json::from_str::<Value>(&manifest).unwrap_or(Value::String(manifest));
    Ok(json!({
        "ok": verdict.is_pass(),
        "command": "check",
        "task": config.task,
        "manifest": manifest,
        "files": files["files"],
        "run": run,
        "submission": submission,
        "verdict": verdict.to_value(),
    }))
}

fn print_check_summary(report: &Value) {
    println!("task: {}", report["task"].as_str().unwrap_or("-"));
    if let Some(files) = report["files"].as_array() {
        for file in files {
            println!("staged: {}", file.as_str().unwrap_or("-"));
        }
    }
    println!("returncode: {}", report["run"]["returncode"]);
    let stderr = report["run"]["stderr"].as_str().unwrap_or("");
    if !stderr.is_empty() {
        println!("stderr:\n{}", stderr.trim_end());
    }
    let verdict = &report["verdict"];
    println!("status: {}", verdict["status"].as_str().unwrap_or("-"));
    if let Some(message) = verdict["message"].as_str() {
        println!("message: {}", message);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Check { json, .. } => *json,
        Commands::Grade { .. } | Commands::Tools => true,
        Commands::Serve { .. } => false,
    }
}
