// Command execution for EXECUTE.
//
// A command runs directly by argument vector when it has no shell syntax, and
// through `bash -c` (or `sh -c`) otherwise. Either way it runs in the sandbox
// root with a hard timeout, and stdout/stderr are captured together.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::command::direct_argv;
use super::policy::ApprovedCommand;
use crate::error::ToolError;

/// Characters of output kept per execution-log line.
const LOG_OUTPUT_CHARS: usize = 500;

/// Result of running one approved command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub combined_output: String,
    pub exit_status: Option<i32>,
}

/// Runs approved commands.
#[derive(Debug, Clone)]
pub struct Executor {
    root: PathBuf,
    max_output_chars: usize,
}

impl Executor {
    pub fn new(root: impl Into<PathBuf>, max_output_chars: usize) -> Self {
        Self {
            root: root.into(),
            max_output_chars,
        }
    }

    /// Run `command` in the sandbox root. The string executed is exactly the
    /// one that was approved.
    pub async fn run(
        &self,
        command: &ApprovedCommand,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ToolError> {
        let raw = command.as_str();
        let mut process = match direct_argv(raw) {
            Some(argv) => {
                tracing::debug!(program = %argv[0], "running without a shell");
                let mut process = tokio::process::Command::new(&argv[0]);
                process.args(&argv[1..]);
                process
            }
            None => {
                let mut process = tokio::process::Command::new(resolve_shell());
                process.arg("-c").arg(raw);
                process
            }
        };
        process.current_dir(&self.root);

        tracing::info!(command = %preview(raw), timeout_secs = timeout.as_secs(), "executing command");
        let output = run_with_timeout(process, timeout).await?;
        Ok(self.outcome(&output))
    }

    fn outcome(&self, output: &std::process::Output) -> ExecutionOutcome {
        let exit_status = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let content = combine_streams(&stdout, &stderr, exit_status.unwrap_or(-1));
        ExecutionOutcome {
            success: output.status.success(),
            combined_output: elide_middle(&content, self.max_output_chars),
            exit_status,
        }
    }
}

/// Spawn `process` with piped output and wait at most `timeout`. The child is
/// killed when the timeout fires.
pub(crate) async fn run_with_timeout(
    mut process: tokio::process::Command,
    timeout: Duration,
) -> Result<std::process::Output, ToolError> {
    let child = process
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::io("failed to spawn command", e))?;

    tokio::select! {
        result = child.wait_with_output() => {
            result.map_err(|e| ToolError::io("command execution error", e))
        }
        _ = tokio::time::sleep(timeout) => {
            // kill_on_drop handles cleanup when `child` is dropped here
            Err(ToolError::ExecutionTimeout(timeout.as_secs()))
        }
    }
}

/// Resolve the shell binary to use. Validation assumes POSIX shell grammar, so
/// `$SHELL` is not consulted.
pub(crate) fn resolve_shell() -> String {
    if Path::new("/bin/bash").exists() {
        return "/bin/bash".to_string();
    }
    "/bin/sh".to_string()
}

/// Merge captured streams into the text the agent sees. Stderr is labelled
/// and a nonzero exit is noted last.
pub(crate) fn combine_streams(stdout: &str, stderr: &str, exit_code: i32) -> String {
    let mut sections: Vec<String> = Vec::new();
    if !stdout.is_empty() {
        sections.push(stdout.trim_end_matches('\n').to_string());
    }
    if !stderr.is_empty() {
        sections.push(format!("[stderr]\n{}", stderr.trim_end_matches('\n')));
    }
    if exit_code != 0 {
        sections.push(format!("[exit status {exit_code}]"));
    }
    if sections.is_empty() {
        return "(no output)".to_string();
    }
    sections.join("\n")
}

/// Characters reserved for the elision notice.
const ELISION_RESERVE: usize = 60;

/// Shorten `text` to roughly `max_chars` characters by cutting from the
/// middle: two thirds of the budget go to the head, the rest to the tail.
/// Cuts always land on character boundaries.
pub(crate) fn elide_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let budget = max_chars.saturating_sub(ELISION_RESERVE);
    let head = budget * 2 / 3;
    let tail = budget - head;
    let offset_of = |n: usize| text.char_indices().nth(n).map_or(text.len(), |(i, _)| i);
    format!(
        "{}\n\n[... {} characters omitted ...]\n\n{}",
        &text[..offset_of(head)],
        total - head - tail,
        &text[offset_of(total - tail)..],
    )
}

fn preview(raw: &str) -> String {
    raw.chars().take(200).collect()
}

// ── Execution log ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ExecLogEntry<'a> {
    timestamp: String,
    command: &'a str,
    success: bool,
    output: String,
}

/// Append-only JSON-lines log of every EXECUTE attempt.
#[derive(Debug, Clone)]
pub struct ExecLog {
    path: PathBuf,
}

impl ExecLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Each line goes out in a single write on an
    /// append-mode handle, so concurrent writers never interleave within it.
    pub async fn record(&self, command: &str, success: bool, output: &str) -> Result<(), ToolError> {
        let entry = ExecLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            command,
            success,
            output: output.chars().take(LOG_OUTPUT_CHARS).collect(),
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| {
            ToolError::io("serializing execution log entry", std::io::Error::other(e))
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ToolError::io(format!("opening {}", self.path.display()), e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::io(format!("writing {}", self.path.display()), e))?;
        file.flush()
            .await
            .map_err(|e| ToolError::io(format!("writing {}", self.path.display()), e))?;
        Ok(())
    }
}
