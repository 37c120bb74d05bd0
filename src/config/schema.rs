use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tools::policy::PolicyConfig;

/// Hard ceiling for any command's wall-clock budget.
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sandbox root. Defaults to the current directory.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Program and directory policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Command execution settings.
    #[serde(default)]
    pub exec: ExecSettings,

    /// File read/write settings.
    #[serde(default)]
    pub files: FileSettings,

    /// Optional OS-level sandbox.
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

/// Command execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSettings {
    /// Default wall-clock budget per command, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Append-only execution log. Defaults to `<root>/.toolgate/exec.log`.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Output longer than this many characters is truncated for display.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

/// File operation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSettings {
    /// READ returns at most this many bytes.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,

    /// Where overwritten files are backed up. Defaults to
    /// `<root>/.toolgate/backups`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

/// What to do when a sandbox is requested but cannot run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxFallback {
    /// Report the command as failed.
    #[default]
    Refuse,
    /// Run the command directly, outside the sandbox.
    Direct,
}

/// Sandbox settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub on_unavailable: SandboxFallback,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            log_path: None,
            max_output_chars: default_max_output_chars(),
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
            backup_dir: None,
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_output_chars() -> usize {
    30_000
}

fn default_max_read_bytes() -> u64 {
    100_000
}

impl Config {
    /// Validate configuration values, returning an error with a helpful message
    /// if any value is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.exec.timeout_secs == 0 {
            anyhow::bail!("exec.timeout_secs must be greater than 0");
        }
        if self.exec.timeout_secs > MAX_TIMEOUT_SECS {
            anyhow::bail!(
                "exec.timeout_secs must be at most {MAX_TIMEOUT_SECS}, got {}",
                self.exec.timeout_secs
            );
        }
        if self.exec.max_output_chars < 200 {
            anyhow::bail!("exec.max_output_chars must be at least 200");
        }
        if self.files.max_read_bytes == 0 {
            anyhow::bail!("files.max_read_bytes must be greater than 0");
        }
        let programs = match &self.policy.programs {
            crate::tools::policy::ProgramPolicy::AllowList(list) => list,
            crate::tools::policy::ProgramPolicy::DenyList(list) => list,
        };
        if programs.iter().any(|p| p.trim().is_empty()) {
            anyhow::bail!("policy.programs entries cannot be empty");
        }
        Ok(())
    }
}
