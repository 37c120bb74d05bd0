// Path confinement: every file path the agent names is resolved here before
// anything touches the filesystem.
//
// Paths are expanded (`~`), anchored to the sandbox root when relative,
// canonicalized through every existing component (so symlinks and `..` cannot
// smuggle a path out), and then compared component-wise against the configured
// directory sets.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::policy::PolicyConfig;
use crate::config::substitute_env_vars;
use crate::error::ToolError;

/// Directory under the sandbox root holding backups and the execution log.
/// Agents may read it but never write into it.
pub const STATE_DIR: &str = ".toolgate";

/// Whether a path is about to be read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// An absolute, symlink-resolved path that passed the guard.
///
/// Only [`PathGuard::resolve`] constructs these, so holding one is proof the
/// path was checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("path escapes project directory: {}", .0.display())]
    Escape(PathBuf),
    #[error("path is inside denied directory {}", .0.display())]
    DeniedDirectory(PathBuf),
    #[error("path is inside read-only directory {}", .0.display())]
    ReadOnly(PathBuf),
    #[error("cannot resolve path: {0}")]
    Unresolvable(String),
    #[error("empty path")]
    Empty,
}

/// Outcome of [`PathGuard::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Allowed(ResolvedPath),
    Denied(DenyReason),
}

impl PathDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PathDecision::Allowed(_))
    }

    /// The resolved path, present only when the decision is `Allowed`.
    pub fn resolved_path(&self) -> Option<&Path> {
        match self {
            PathDecision::Allowed(p) => Some(p.as_path()),
            PathDecision::Denied(_) => None,
        }
    }

    pub fn into_result(self) -> Result<ResolvedPath, ToolError> {
        match self {
            PathDecision::Allowed(p) => Ok(p),
            PathDecision::Denied(DenyReason::Escape(path)) => Err(ToolError::PathEscape(path)),
            PathDecision::Denied(reason) => Err(ToolError::PolicyViolation(reason.to_string())),
        }
    }
}

/// Resolves agent-supplied paths against the sandbox root and directory sets.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
    allowed: Vec<PathBuf>,
    read_only: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl PathGuard {
    /// Build a guard for `root`. The root must exist; configured directory
    /// entries need not.
    pub fn new(root: impl AsRef<Path>, policy: &PolicyConfig) -> Result<Self, ToolError> {
        let root_ref = root.as_ref();
        let root = std::fs::canonicalize(root_ref).map_err(|e| {
            ToolError::io(format!("resolving sandbox root {}", root_ref.display()), e)
        })?;

        let resolve_set = |entries: &[String]| -> Vec<PathBuf> {
            entries
                .iter()
                .map(|e| substitute_env_vars(e.trim()))
                .filter(|e| !e.is_empty())
                .map(|e| resolve_or_normalize(&anchor(&root, &e)))
                .collect()
        };

        let allowed = resolve_set(&policy.allowed_dirs);
        let mut read_only = resolve_set(&policy.read_only_dirs);
        read_only.push(root.join(STATE_DIR));
        let denied = resolve_set(&policy.denied_dirs);

        tracing::debug!(
            root = %root.display(),
            allowed = allowed.len(),
            read_only = read_only.len(),
            denied = denied.len(),
            "path guard ready"
        );

        Ok(Self {
            root,
            allowed,
            read_only,
            denied,
        })
    }

    /// The canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decide whether `requested` may be accessed in `mode`.
    pub fn resolve(&self, requested: &str, mode: AccessMode) -> PathDecision {
        let requested = requested.trim();
        if requested.is_empty() {
            return PathDecision::Denied(DenyReason::Empty);
        }

        let candidate = anchor(&self.root, requested);
        let resolved = match canonicalize_lenient(&candidate) {
            Ok(p) => p,
            Err(e) => {
                return PathDecision::Denied(DenyReason::Unresolvable(format!(
                    "{}: {}",
                    candidate.display(),
                    e
                )))
            }
        };

        let decision = self.check(resolved, mode);
        if let PathDecision::Denied(reason) = &decision {
            tracing::warn!(path = requested, ?mode, %reason, "path rejected");
        }
        decision
    }

    fn check(&self, resolved: PathBuf, mode: AccessMode) -> PathDecision {
        if let Some(dir) = self.denied_dir_for(&resolved) {
            return PathDecision::Denied(DenyReason::DeniedDirectory(dir.to_path_buf()));
        }

        let in_writable = resolved.starts_with(&self.root)
            || self.allowed.iter().any(|d| resolved.starts_with(d));

        match mode {
            AccessMode::Write => {
                if let Some(dir) = self.read_only_dir_for(&resolved) {
                    return PathDecision::Denied(DenyReason::ReadOnly(dir.to_path_buf()));
                }
                if !in_writable {
                    return PathDecision::Denied(DenyReason::Escape(resolved));
                }
            }
            AccessMode::Read => {
                let in_readable =
                    in_writable || self.read_only.iter().any(|d| resolved.starts_with(d));
                if !in_readable {
                    return PathDecision::Denied(DenyReason::Escape(resolved));
                }
            }
        }

        PathDecision::Allowed(ResolvedPath(resolved))
    }

    /// The denied directory containing `path`, if any. `path` must already be
    /// absolute and resolved.
    pub fn denied_dir_for(&self, path: &Path) -> Option<&Path> {
        self.denied
            .iter()
            .find(|d| path.starts_with(d))
            .map(PathBuf::as_path)
    }

    /// The read-only directory containing `path`, if any. Includes the state
    /// directory.
    pub fn read_only_dir_for(&self, path: &Path) -> Option<&Path> {
        self.read_only
            .iter()
            .find(|d| path.starts_with(d))
            .map(PathBuf::as_path)
    }

    /// Resolve a path fragment found inside a shell command the same way a
    /// requested path is resolved. Falls back to lexical normalization when a
    /// component cannot be resolved, since a command string may name paths
    /// that do not exist yet.
    pub fn resolve_fragment(&self, fragment: &str) -> PathBuf {
        resolve_or_normalize(&anchor(&self.root, fragment))
    }

    /// Render `path` relative to the root when it lives inside it.
    pub fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Expand a leading `~` or `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `~` and join relative paths onto `root`.
pub(crate) fn anchor(root: &Path, path: &str) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    }
}

fn resolve_or_normalize(path: &Path) -> PathBuf {
    canonicalize_lenient(path).unwrap_or_else(|_| normalize_lexically(path))
}

/// Canonicalize `path` component by component. Components that exist are
/// resolved through the filesystem (following symlinks); missing trailing
/// components are appended as-is. A symlink whose target cannot be resolved
/// is an error.
fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => resolved.push(prefix.as_os_str()),
            Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                match std::fs::symlink_metadata(&resolved) {
                    Ok(_) => resolved = std::fs::canonicalize(&resolved)?,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(resolved)
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
