// Tool dispatch: turns extracted calls into file operations and command runs.
//
// Every path goes through the PathGuard and every command through the
// CommandValidator before anything happens; the file and exec layers only
// accept the types those two hand out.

pub mod command;
pub mod exec;
pub mod file_ops;
pub mod path_guard;
pub mod policy;
pub mod sandbox;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::config::schema::{SandboxFallback, MAX_TIMEOUT_SECS};
use crate::config::Config;
use crate::error::ToolError;
use crate::extract::{self, Operation, ToolCall, Warning};
use exec::{elide_middle, ExecLog, ExecutionOutcome, Executor};
use file_ops::{FileStore, WriteReport};
use path_guard::{anchor, AccessMode, PathGuard, STATE_DIR};
use policy::{ApprovedCommand, CommandValidator};
use sandbox::{BubblewrapSandbox, SandboxRunner};

/// Text handed back to the agent for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    fn error(message: impl fmt::Display) -> Self {
        Self {
            content: format!("ERROR: {message}"),
            is_error: true,
        }
    }

    fn clipped(self, max_chars: usize) -> Self {
        Self {
            content: elide_middle(&self.content, max_chars),
            is_error: self.is_error,
        }
    }
}

/// Results of one agent turn, in extraction order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnReport {
    pub results: Vec<(ToolCall, ToolResult)>,
    pub warnings: Vec<Warning>,
}

impl TurnReport {
    /// Result blocks followed by warnings, ready to append to the transcript.
    pub fn render(&self) -> String {
        let mut blocks: Vec<String> = self
            .results
            .iter()
            .map(|(call, result)| {
                let status = if result.is_error { "failed" } else { "ok" };
                format!(
                    "=== {} [{}] ===\n{}",
                    call.summary(),
                    status,
                    result.content.trim_end()
                )
            })
            .collect();
        blocks.extend(self.warnings.iter().map(Warning::to_string));
        blocks.join("\n\n")
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|(_, r)| r.is_error)
    }
}

/// Maps canonical calls onto guarded actions. One instance per agent session;
/// calls are handled one at a time, in order.
pub struct Dispatcher {
    guard: PathGuard,
    validator: CommandValidator,
    files: FileStore,
    executor: Executor,
    log: ExecLog,
    sandbox: Option<Box<dyn SandboxRunner>>,
    on_unavailable: SandboxFallback,
    timeout_secs: u64,
    max_output_chars: usize,
    dry_run: bool,
}

impl Dispatcher {
    /// Build a dispatcher confined to `root`. A bubblewrap sandbox is attached
    /// when `config.sandbox.enabled` is set.
    pub fn new(root: impl AsRef<Path>, config: &Config) -> Result<Self, ToolError> {
        let guard = PathGuard::new(root, &config.policy)?;
        let root = guard.root().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        let located = |configured: &Option<std::path::PathBuf>, default: &str| {
            configured
                .as_ref()
                .and_then(|p| p.to_str())
                .map(|p| anchor(&root, p))
                .unwrap_or_else(|| state_dir.join(default))
        };

        let log = ExecLog::new(located(&config.exec.log_path, "exec.log"));
        let files = FileStore::new(
            &root,
            located(&config.files.backup_dir, "backups"),
            config.files.max_read_bytes,
        );
        let executor = Executor::new(&root, config.exec.max_output_chars);
        let sandbox: Option<Box<dyn SandboxRunner>> = config.sandbox.enabled.then(|| {
            Box::new(BubblewrapSandbox::new(&root, config.exec.max_output_chars))
                as Box<dyn SandboxRunner>
        });

        Ok(Self {
            validator: CommandValidator::new(&config.policy, guard.clone()),
            guard,
            files,
            executor,
            log,
            sandbox,
            on_unavailable: config.sandbox.on_unavailable,
            timeout_secs: config.exec.timeout_secs.clamp(1, MAX_TIMEOUT_SECS),
            max_output_chars: config.exec.max_output_chars,
            dry_run: false,
        })
    }

    /// Route EXECUTE through `sandbox` instead of direct process invocation.
    pub fn with_sandbox(mut self, sandbox: Box<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Validate and resolve everything but touch nothing.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    /// Extract every call from `text` and dispatch them strictly in order.
    pub async fn run_turn(&self, text: &str) -> TurnReport {
        let extraction = extract::extract(text);
        let mut results = Vec::with_capacity(extraction.calls.len());
        for call in extraction.calls {
            let result = self.dispatch(&call).await;
            results.push((call, result));
        }
        tracing::info!(
            calls = results.len(),
            failed = results.iter().filter(|(_, r)| r.is_error).count(),
            warnings = extraction.warnings.len(),
            "turn complete"
        );
        TurnReport {
            results,
            warnings: extraction.warnings,
        }
    }

    /// Perform one call. Never fails: errors come back as `ERROR: ` results.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolResult {
        tracing::info!(operation = %call.operation, source = ?call.source, "dispatching tool call");
        let result = match call.operation {
            Operation::Read => self.read(call).await,
            Operation::Write | Operation::Append => self.write(call).await,
            Operation::Execute => self.execute(call).await,
        };
        result
            .unwrap_or_else(ToolResult::error)
            .clipped(self.max_output_chars)
    }

    async fn read(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let requested = call.path().ok_or(ToolError::MissingParameter("path"))?;
        let path = self.guard.resolve(requested, AccessMode::Read).into_result()?;
        if self.dry_run {
            return Ok(ToolResult::success(format!(
                "(dry run) would read {}",
                self.guard.display_path(path.as_path())
            )));
        }
        Ok(ToolResult::success(self.files.read(&path).await?))
    }

    async fn write(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let requested = call.path().ok_or(ToolError::MissingParameter("path"))?;
        let content = call.content().ok_or(ToolError::MissingParameter("content"))?;
        let path = self.guard.resolve(requested, AccessMode::Write).into_result()?;
        let shown = self.guard.display_path(path.as_path());
        let verb = match call.operation {
            Operation::Append => "append",
            _ => "write",
        };

        if self.dry_run {
            return Ok(ToolResult::success(format!(
                "(dry run) would {verb} {} bytes to {shown}",
                content.len()
            )));
        }

        let report = match call.operation {
            Operation::Append => self.files.append(&path, content).await?,
            _ => self.files.write(&path, content).await?,
        };
        Ok(ToolResult::success(describe_write(
            verb,
            content.len(),
            &shown,
            &report,
            &self.guard,
        )))
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let raw = call.command().ok_or(ToolError::MissingParameter("command"))?;
        let timeout_secs = call
            .timeout_secs()
            .unwrap_or(self.timeout_secs)
            .clamp(1, MAX_TIMEOUT_SECS);

        let approved = match self.validator.approve(raw) {
            Ok(approved) => approved,
            Err(e) => {
                if !self.dry_run {
                    self.record(raw, false, &e.to_string()).await;
                }
                return Err(e);
            }
        };
        if self.dry_run {
            return Ok(ToolResult::success(format!(
                "(dry run) would run with a {timeout_secs}s timeout: {}",
                approved.as_str()
            )));
        }

        let timeout = Duration::from_secs(timeout_secs);
        let outcome = self.run_approved(&approved, timeout).await;
        match &outcome {
            Ok(o) => self.record(raw, o.success, &o.combined_output).await,
            Err(e) => self.record(raw, false, &e.to_string()).await,
        }

        let outcome = outcome?;
        if outcome.success {
            Ok(ToolResult::success(outcome.combined_output))
        } else {
            Ok(ToolResult::error(format!(
                "command failed\n{}",
                outcome.combined_output
            )))
        }
    }

    async fn run_approved(
        &self,
        command: &ApprovedCommand,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, ToolError> {
        if let Some(sandbox) = &self.sandbox {
            if sandbox.is_available() {
                let (success, combined_output) = sandbox.run(command, timeout).await;
                return Ok(ExecutionOutcome {
                    success,
                    combined_output,
                    exit_status: None,
                });
            }
            match self.on_unavailable {
                SandboxFallback::Refuse => {
                    tracing::warn!("sandbox unavailable, refusing to run command");
                    return Err(ToolError::SandboxUnavailable);
                }
                SandboxFallback::Direct => {
                    tracing::warn!("sandbox unavailable, running command directly");
                }
            }
        }
        self.executor.run(command, timeout).await
    }

    async fn record(&self, command: &str, success: bool, output: &str) {
        if let Err(e) = self.log.record(command, success, output).await {
            tracing::warn!(error = %e, "failed to append to execution log");
        }
    }
}

fn describe_write(
    verb: &str,
    written: usize,
    shown: &str,
    report: &WriteReport,
    guard: &PathGuard,
) -> String {
    let mut message = match verb {
        "append" => format!(
            "Appended {written} bytes to {shown} (now {} bytes)",
            report.bytes
        ),
        _ => format!("Wrote {} bytes to {shown}", report.bytes),
    };
    if let Some(backup) = &report.backup {
        message.push_str(&format!(
            "\nPrevious version backed up to {}",
            guard.display_path(backup)
        ));
    }
    if let Some(warning) = &report.backup_warning {
        message.push_str(&format!("\nWARNING: {warning}"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SourceSyntax;
    use crate::tools::policy::{PolicyConfig, ProgramPolicy};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn config(programs: &[&str]) -> Config {
        Config {
            policy: PolicyConfig {
                programs: ProgramPolicy::AllowList(programs.iter().map(|p| p.to_string()).collect()),
                denied_dirs: vec!["secret".to_string()],
                ..PolicyConfig::default()
            },
            ..Config::default()
        }
    }

    fn call(operation: Operation, params: &[(&str, &str)]) -> ToolCall {
        ToolCall {
            operation,
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            source: SourceSyntax::InvokeBlock,
        }
    }

    fn log_lines(dir: &TempDir) -> Vec<serde_json::Value> {
        let path = dir.path().join(".toolgate/exec.log");
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    struct FakeSandbox {
        available: bool,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SandboxRunner for FakeSandbox {
        async fn run(&self, command: &ApprovedCommand, _timeout: Duration) -> (bool, String) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            (true, format!("sandboxed: {}", command.as_str()))
        }

        fn is_available(&self) -> bool {
            self.available
        }
    }

    #[tokio::test]
    async fn test_long_results_are_clipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(5000)).unwrap();
        let mut settings = config(&[]);
        settings.exec.max_output_chars = 1000;
        let dispatcher = Dispatcher::new(dir.path(), &settings).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Read, &[("path", "big.txt")]))
            .await;
        assert!(!result.is_error);
        assert!(result.content.chars().count() <= 1000);
        assert!(result.content.contains("characters omitted"));

        let short = ToolResult::error("nope").clipped(1000);
        assert_eq!(short.content, "ERROR: nope");
        assert!(short.is_error);
    }

    #[tokio::test]
    async fn test_write_file_invoke_then_backup() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["ls"])).unwrap();
        let text = r#"<function_calls>
<invoke name="write_file">
<parameter name="file_path">output.txt</parameter>
<parameter name="content">X</parameter>
</invoke>
</function_calls>"#;

        let first = dispatcher.run_turn(text).await;
        assert!(!first.has_errors());
        assert_eq!(std::fs::read_to_string(dir.path().join("output.txt")).unwrap(), "X");

        let second = dispatcher.run_turn(text).await;
        assert!(second.results[0].1.content.contains("backed up"));
        let backups: Vec<_> = std::fs::read_dir(dir.path().join(".toolgate/backups"))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_write_then_read_in_one_turn() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["cat"])).unwrap();
        let text = "<write file=\"a/b.txt\">hello</write>\n<read>a/b.txt</read>\n<bash>cat a/b.txt</bash>";
        let report = dispatcher.run_turn(text).await;
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[1].1.content, "hello");
        assert_eq!(report.results[2].1.content, "hello");
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root_accepted() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&[])).unwrap();
        let absolute = dispatcher.guard().root().join("abs.txt");
        let result = dispatcher
            .dispatch(&call(
                Operation::Write,
                &[("path", absolute.to_str().unwrap()), ("content", "a")],
            ))
            .await;
        assert!(!result.is_error, "{}", result.content);
    }

    #[tokio::test]
    async fn test_escape_is_error() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&[])).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Read, &[("path", "../../etc/hostname")]))
            .await;
        assert!(result.is_error);
        assert!(result.content.starts_with("ERROR: "));
    }

    #[tokio::test]
    async fn test_missing_parameter() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&[])).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Write, &[("path", "x.txt")]))
            .await;
        assert_eq!(result.content, "ERROR: missing required parameter 'content'");
    }

    #[tokio::test]
    async fn test_denied_command_is_logged_and_not_run() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["ls"])).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "touch pwned")]))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("'touch' is not in the allow-list"));
        assert!(!dir.path().join("pwned").exists());

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["command"], "touch pwned");
        assert_eq!(lines[0]["success"], false);
    }

    #[tokio::test]
    async fn test_arithmetic_shift_cannot_hide_commands() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["echo"])).unwrap();
        let report = dispatcher
            .run_turn("<bash>echo $((x<<y))\ntouch pwned\ny</bash>")
            .await;
        assert_eq!(report.results.len(), 1);
        assert!(report.results[0].1.content.contains("'touch' is not in the allow-list"));
        assert!(!dir.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn test_function_redefinition_cannot_hide_commands() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["echo"])).unwrap();
        for command in ["echo() { touch pwned; }; echo", "function echo { touch pwned; }; echo"] {
            let result = dispatcher
                .dispatch(&call(Operation::Execute, &[("command", command)]))
                .await;
            assert!(result.is_error, "{command}");
            assert!(result.content.contains("'touch'"));
        }
        assert!(!dir.path().join("pwned").exists());
    }

    #[tokio::test]
    async fn test_command_cannot_overwrite_exec_log() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["echo"])).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "echo x > .toolgate/exec.log")]))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("read-only directory"));

        let lines = log_lines(&dir);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["success"], false);
    }

    #[tokio::test]
    async fn test_command_touching_denied_dir_is_refused() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["cat"])).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "cat ./secret/key")]))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("denied directory"));
    }

    #[tokio::test]
    async fn test_failed_command_is_error_with_output() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["ls"])).unwrap();
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "ls no-such-dir")]))
            .await;
        assert!(result.is_error);
        assert!(result.content.starts_with("ERROR: command failed"));
        assert_eq!(log_lines(&dir)[0]["success"], false);
    }

    #[tokio::test]
    async fn test_timeout_parameter_is_honoured() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["sleep"])).unwrap();
        let result = dispatcher
            .dispatch(&call(
                Operation::Execute,
                &[("command", "sleep 30"), ("timeout", "1")],
            ))
            .await;
        assert_eq!(result.content, "ERROR: command timed out after 1s");
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&["touch"]))
            .unwrap()
            .with_dry_run(true);
        let report = dispatcher
            .run_turn("<write file=\"a.txt\">x</write>\n<bash>touch b.txt</bash>\n<bash>rm a.txt</bash>")
            .await;
        assert!(report.results[0].1.content.starts_with("(dry run) would write 1 bytes"));
        assert!(report.results[1].1.content.contains("would run"));
        assert!(report.results[2].1.is_error);
        assert!(!dir.path().join("a.txt").exists());
        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join(".toolgate").exists());
    }

    #[tokio::test]
    async fn test_sandbox_used_when_available() {
        let dir = TempDir::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(dir.path(), &config(&["ls"]))
            .unwrap()
            .with_sandbox(Box::new(FakeSandbox {
                available: true,
                runs: runs.clone(),
            }));
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "ls -la")]))
            .await;
        assert_eq!(result.content, "sandboxed: ls -la");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_refuses_by_default() {
        let dir = TempDir::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(dir.path(), &config(&["ls"]))
            .unwrap()
            .with_sandbox(Box::new(FakeSandbox {
                available: false,
                runs: runs.clone(),
            }));
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "ls")]))
            .await;
        assert_eq!(result.content, "ERROR: sandbox unavailable");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_can_fall_back() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("here.txt"), "").unwrap();
        let mut cfg = config(&["ls"]);
        cfg.sandbox.on_unavailable = SandboxFallback::Direct;
        let dispatcher = Dispatcher::new(dir.path(), &cfg)
            .unwrap()
            .with_sandbox(Box::new(FakeSandbox {
                available: false,
                runs: Arc::new(AtomicUsize::new(0)),
            }));
        let result = dispatcher
            .dispatch(&call(Operation::Execute, &[("command", "ls")]))
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("here.txt"));
    }

    #[tokio::test]
    async fn test_render_includes_results_and_warnings() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(dir.path(), &config(&[])).unwrap();
        let report = dispatcher
            .run_turn("<read>missing.txt</read>\n<bash>ls")
            .await;
        let rendered = report.render();
        assert!(rendered.starts_with("=== READ missing.txt [failed] ===\nERROR: reading missing.txt"));
        assert!(rendered.contains("WARNING (line 2): <bash> tag is never closed"));
    }
}
