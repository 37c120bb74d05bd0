use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the tool layer.
///
/// None of these ever escape a dispatch: the dispatcher renders them into an
/// `ERROR: ` prefixed result string the agent can read and react to.
#[derive(Debug, Error)]
pub enum ToolError {
    /// A program or path was refused by the configured policy.
    #[error("{0}")]
    PolicyViolation(String),

    /// The resolved path lies outside every directory the agent may touch.
    #[error("path escapes project directory: {}", .0.display())]
    PathEscape(PathBuf),

    /// A tool-call-like fragment or command string could not be parsed.
    #[error("could not parse {what}: {detail}")]
    ParseAmbiguity { what: &'static str, detail: String },

    /// The command ran past its wall-clock budget and was killed.
    #[error("command timed out after {0}s")]
    ExecutionTimeout(u64),

    /// Underlying filesystem or process failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("sandbox unavailable")]
    SandboxUnavailable,
}

impl ToolError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_escape_message() {
        let err = ToolError::PathEscape(PathBuf::from("/etc/passwd"));
        assert_eq!(
            err.to_string(),
            "path escapes project directory: /etc/passwd"
        );
    }

    #[test]
    fn test_io_message_includes_context() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ToolError::io("writing out.txt", source);
        assert!(err.to_string().starts_with("writing out.txt: "));
    }
}
