// OS-level sandbox seam. The dispatcher only needs `run` and `is_available`;
// `BubblewrapSandbox` is the bundled implementation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::exec::{combine_streams, elide_middle, resolve_shell, run_with_timeout};
use super::policy::ApprovedCommand;

/// Runs approved commands inside an isolation layer.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run `command` with a wall-clock budget. Returns the success flag and
    /// combined output.
    async fn run(&self, command: &ApprovedCommand, timeout: Duration) -> (bool, String);

    /// Whether the sandbox can run commands on this host.
    fn is_available(&self) -> bool;
}

/// Runs commands under `bwrap` with the sandbox root bound read-write and the
/// rest of the filesystem read-only.
#[derive(Debug, Clone)]
pub struct BubblewrapSandbox {
    root: PathBuf,
    max_output_chars: usize,
}

impl BubblewrapSandbox {
    pub fn new(root: impl Into<PathBuf>, max_output_chars: usize) -> Self {
        Self {
            root: root.into(),
            max_output_chars,
        }
    }

    fn arguments(&self, command: &str) -> Vec<String> {
        let root = self.root.display().to_string();
        [
            "--ro-bind", "/", "/",
            "--dev", "/dev",
            "--proc", "/proc",
            "--tmpfs", "/tmp",
            "--bind", root.as_str(), root.as_str(),
            "--chdir", root.as_str(),
            "--unshare-all",
            "--die-with-parent",
            "--",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([resolve_shell(), "-c".to_string(), command.to_string()])
        .collect()
    }
}

#[async_trait]
impl SandboxRunner for BubblewrapSandbox {
    async fn run(&self, command: &ApprovedCommand, timeout: Duration) -> (bool, String) {
        let mut process = tokio::process::Command::new("bwrap");
        process.args(self.arguments(command.as_str()));
        match run_with_timeout(process, timeout).await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let content = combine_streams(&stdout, &stderr, output.status.code().unwrap_or(-1));
                (
                    output.status.success(),
                    elide_middle(&content, self.max_output_chars),
                )
            }
            Err(e) => (false, e.to_string()),
        }
    }

    fn is_available(&self) -> bool {
        which::which("bwrap").is_ok()
    }
}
