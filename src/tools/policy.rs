// Command policy: which programs may run and which directories a command may
// mention.
//
// Two mutually exclusive modes:
// - allow_list: only listed base names may run ("*" disables the check)
// - deny_list:  everything runs except listed base names
//
// Entries are matched against the program's base name and may be glob
// patterns (e.g. "python3*").

use serde::{Deserialize, Serialize};

use super::command;
use super::path_guard::PathGuard;
use crate::error::ToolError;

/// Program authorization mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramPolicy {
    AllowList(Vec<String>),
    DenyList(Vec<String>),
}

impl Default for ProgramPolicy {
    fn default() -> Self {
        ProgramPolicy::AllowList(default_allowed_programs())
    }
}

/// Immutable per-session policy, supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub programs: ProgramPolicy,

    /// Extra directories (beyond the sandbox root) the agent may read and write.
    #[serde(default)]
    pub allowed_dirs: Vec<String>,

    /// Directories the agent may read but never write.
    #[serde(default)]
    pub read_only_dirs: Vec<String>,

    /// Directories no file operation or command may touch.
    #[serde(default = "default_denied_dirs")]
    pub denied_dirs: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            programs: ProgramPolicy::default(),
            allowed_dirs: Vec::new(),
            read_only_dirs: Vec::new(),
            denied_dirs: default_denied_dirs(),
        }
    }
}

fn default_allowed_programs() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "wc", "grep", "find", "sort", "uniq", "diff", "echo",
        "printf", "pwd", "mkdir", "touch", "cp", "mv", "sed", "awk", "cut", "tr", "tee", "test",
        "[", "true", "false", "sleep", "git", "cargo", "rustc", "python3", "make",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_denied_dirs() -> Vec<String> {
    ["~/.ssh", "~/.gnupg", "~/.aws", "~/.config/gcloud", "/etc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Outcome of validating one command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: String,
}

impl ValidationResult {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "allowed".to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// A command string that passed validation, byte-for-byte as submitted.
///
/// Executors only accept this type, and only [`CommandValidator::approve`]
/// creates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovedCommand(String);

impl ApprovedCommand {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
enum ProgramMatcher {
    Glob(glob::Pattern),
    Exact(String),
}

impl ProgramMatcher {
    fn new(entry: &str) -> Self {
        match glob::Pattern::new(entry) {
            Ok(p) => ProgramMatcher::Glob(p),
            Err(_) => ProgramMatcher::Exact(entry.to_string()),
        }
    }

    fn matches(&self, program: &str) -> bool {
        match self {
            ProgramMatcher::Glob(p) => p.matches(program),
            ProgramMatcher::Exact(s) => s == program,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Allow,
    Deny,
}

/// Validates command strings against a [`PolicyConfig`].
#[derive(Debug, Clone)]
pub struct CommandValidator {
    mode: Mode,
    matchers: Vec<ProgramMatcher>,
    unrestricted: bool,
    guard: PathGuard,
}

impl CommandValidator {
    /// `guard` supplies the denied-directory set and path resolution.
    pub fn new(policy: &PolicyConfig, guard: PathGuard) -> Self {
        let (mode, entries) = match &policy.programs {
            ProgramPolicy::AllowList(list) => (Mode::Allow, list),
            ProgramPolicy::DenyList(list) => (Mode::Deny, list),
        };
        let entries: Vec<&str> = entries
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();
        let unrestricted = mode == Mode::Allow && entries.iter().any(|e| *e == "*");
        Self {
            mode,
            matchers: entries.into_iter().map(ProgramMatcher::new).collect(),
            unrestricted,
            guard,
        }
    }

    /// Check `raw` against the program list and the denied directories.
    /// Never panics on malformed input; unparseable commands are denied.
    pub fn validate(&self, raw: &str) -> ValidationResult {
        match self.check(raw) {
            Ok(()) => ValidationResult::allow(),
            Err(e) => ValidationResult::deny(e.to_string()),
        }
    }

    /// Validate `raw` and, if allowed, wrap the untouched original for execution.
    pub fn approve(&self, raw: &str) -> Result<ApprovedCommand, ToolError> {
        self.check(raw)?;
        Ok(ApprovedCommand(raw.to_string()))
    }

    fn check(&self, raw: &str) -> Result<(), ToolError> {
        let outcome = self.evaluate(raw);
        if let Err(e) = &outcome {
            tracing::warn!(command = %preview(raw), reason = %e, "command denied");
        }
        outcome
    }

    fn evaluate(&self, raw: &str) -> Result<(), ToolError> {
        if raw.trim().is_empty() {
            return Err(violation("empty command"));
        }
        if self.unrestricted {
            return Ok(());
        }

        let analysis = command::analyze(raw).map_err(|e| ToolError::ParseAmbiguity {
            what: "command",
            detail: e.to_string(),
        })?;
        if analysis.programs.is_empty() {
            return Err(violation("could not find a program to run"));
        }

        for program in &analysis.programs {
            let listed = self.matchers.iter().any(|m| m.matches(program));
            match self.mode {
                Mode::Allow if !listed => {
                    return Err(violation(format!(
                        "program '{program}' is not in the allow-list"
                    )));
                }
                Mode::Deny if listed => {
                    return Err(violation(format!("program '{program}' is in the deny-list")));
                }
                _ => {}
            }
        }

        for operand in &analysis.operands {
            for fragment in path_fragments(operand) {
                let resolved = self.guard.resolve_fragment(fragment);
                if let Some(dir) = self.guard.denied_dir_for(&resolved) {
                    return Err(violation(format!(
                        "command references denied directory {}: {}",
                        dir.display(),
                        fragment
                    )));
                }
            }
        }

        for target in &analysis.write_targets {
            let resolved = self.guard.resolve_fragment(target);
            if let Some(dir) = self.guard.read_only_dir_for(&resolved) {
                return Err(violation(format!(
                    "command redirects output into read-only directory {}: {}",
                    dir.display(),
                    target
                )));
            }
        }

        Ok(())
    }
}

fn violation(reason: impl Into<String>) -> ToolError {
    ToolError::PolicyViolation(reason.into())
}

/// The path-like parts of an operand. Besides the whole token, the value
/// after `=` (`--out=dir/x`, `if=/etc/passwd`) and each `:`-separated piece
/// (`host:/etc/x`, `PATH`-style lists) are checked.
fn path_fragments(operand: &str) -> Vec<&str> {
    let mut pieces = vec![operand];
    if let Some((_, value)) = operand.split_once('=') {
        pieces.push(value);
    }
    let split: Vec<&str> = pieces
        .iter()
        .filter(|p| p.contains(':'))
        .flat_map(|p| p.split(':'))
        .collect();
    pieces.extend(split);

    let mut fragments: Vec<&str> = Vec::new();
    for piece in pieces {
        let looks_like_path =
            piece.contains('/') || piece.starts_with('~') || piece.starts_with('.');
        if looks_like_path && !fragments.contains(&piece) {
            fragments.push(piece);
        }
    }
    fragments
}

fn preview(raw: &str) -> String {
    raw.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn validator(dir: &TempDir, programs: ProgramPolicy, denied: &[&str]) -> CommandValidator {
        let policy = PolicyConfig {
            programs,
            allowed_dirs: Vec::new(),
            read_only_dirs: Vec::new(),
            denied_dirs: denied.iter().map(|s| s.to_string()).collect(),
        };
        let guard = PathGuard::new(dir.path(), &policy).unwrap();
        CommandValidator::new(&policy, guard)
    }

    fn allow(list: &[&str]) -> ProgramPolicy {
        ProgramPolicy::AllowList(list.iter().map(|s| s.to_string()).collect())
    }

    fn deny(list: &[&str]) -> ProgramPolicy {
        ProgramPolicy::DenyList(list.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_allow_list_accepts_listed_programs() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["ls", "grep", "wc"]), &[]);
        assert!(v.validate("ls -la | grep rs | wc -l").allowed);
        assert!(v.validate("/bin/ls src").allowed);
    }

    #[test]
    fn test_allow_list_rejects_unlisted_program() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["ls"]), &[]);
        let r = v.validate("ls && rm -rf build");
        assert!(!r.allowed);
        assert!(r.reason.contains("'rm'"));
    }

    #[test]
    fn test_allow_list_glob_pattern() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["python3*"]), &[]);
        assert!(v.validate("python3.12 main.py").allowed);
        assert!(!v.validate("python main.py").allowed);
    }

    #[test]
    fn test_wildcard_short_circuits() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["*"]), &[]);
        assert!(v.validate("anything --goes 'here").allowed);
    }

    #[test]
    fn test_deny_list() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&["rm", "curl"]), &[]);
        assert!(v.validate("ls && cat x").allowed);
        let r = v.validate("echo hi; /usr/bin/curl http://x");
        assert!(!r.allowed);
        assert!(r.reason.contains("'curl'"));
        assert!(!v.validate("echo $(rm -rf x)").allowed);
    }

    #[test]
    fn test_heredoc_body_is_not_validated_as_commands() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["cat"]), &[]);
        let raw = "cat >> notes.md << 'EOF'\n- a\n- b\n1. c\n---\nrm -rf / | curl x\nEOF";
        assert!(v.validate(raw).allowed);
    }

    #[test]
    fn test_unparseable_command_denied() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&[]), &[]);
        let r = v.validate("echo 'unterminated");
        assert!(!r.allowed);
        assert!(r.reason.starts_with("could not parse command"));
    }

    #[test]
    fn test_empty_command_denied() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&[]), &[]);
        assert!(!v.validate("  \n ").allowed);
        assert!(!v.validate("FOO=bar").allowed);
    }

    #[test]
    fn test_denied_directory_fragment() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&[]), &["secret"]);
        assert!(!v.validate("cat secret/key.pem").allowed);
        assert!(!v.validate("cat ./secret/key.pem").allowed);
        assert!(!v.validate("echo x > secret/a").allowed);
        assert!(!v.validate("tar --file=./secret/x.tar -c .").allowed);
        assert!(!v.validate("cat src/../secret/key.pem").allowed);
        assert!(v.validate("cat secret2/key.pem").allowed);
        assert!(v.validate("cat secret").allowed);
    }

    #[test]
    fn test_denied_absolute_directory_boundary() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&[]), &["/etc"]);
        assert!(!v.validate("cat /etc/passwd").allowed);
        assert!(v.validate("ls /etc2/x").allowed);
    }

    #[test]
    fn test_approve_preserves_original_bytes() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["cat"]), &[]);
        let raw = "cat > out.md <<'EOF'\n| not a pipe\n&& not a chain\nEOF\n";
        let approved = v.approve(raw).unwrap();
        assert_eq!(approved.as_str(), raw);
    }

    #[test]
    fn test_approve_denied_is_policy_violation() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["ls"]), &[]);
        let err = v.approve("rm x").unwrap_err();
        assert!(matches!(err, ToolError::PolicyViolation(_)));
    }

    #[test]
    fn test_path_fragments() {
        assert_eq!(path_fragments("src/main.rs"), vec!["src/main.rs"]);
        assert_eq!(path_fragments("~/x"), vec!["~/x"]);
        assert_eq!(path_fragments(".env"), vec![".env"]);
        assert_eq!(path_fragments("--out=build/x"), vec!["--out=build/x", "build/x"]);
        assert_eq!(path_fragments("if=/etc/passwd"), vec!["if=/etc/passwd", "/etc/passwd"]);
        assert_eq!(path_fragments("host:/etc/x"), vec!["host:/etc/x", "/etc/x"]);
        assert!(path_fragments("-la").is_empty());
        assert!(path_fragments("README").is_empty());
    }

    #[test]
    fn test_assignment_style_operands_checked() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&[]), &["/etc"]);
        let r = v.validate("dd if=/etc/passwd of=out");
        assert!(!r.allowed);
        assert!(r.reason.contains("/etc/passwd"));
        assert!(!v.validate("scp host:/etc/shadow .").allowed);
        assert!(!v.validate("PATH=/usr/bin:/etc/x make").allowed);
        assert!(v.validate("dd if=in.img of=out.img").allowed);
    }

    #[test]
    fn test_redirect_into_state_dir_denied() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, deny(&[]), &[]);
        let r = v.validate("echo x > .toolgate/exec.log");
        assert!(!r.allowed);
        assert!(r.reason.contains("read-only"));
        assert!(!v.validate("echo x >> ./.toolgate/exec.log").allowed);
        assert!(!v.validate("make &> .toolgate/backups/x").allowed);
        assert!(v.validate("cat .toolgate/exec.log").allowed);
        assert!(v.validate("make 2>/dev/null > build.log").allowed);
    }

    #[test]
    fn test_redirect_into_read_only_dir_denied() {
        let dir = TempDir::new().unwrap();
        let policy = PolicyConfig {
            programs: deny(&[]),
            allowed_dirs: Vec::new(),
            read_only_dirs: vec!["vendor".to_string()],
            denied_dirs: Vec::new(),
        };
        let guard = PathGuard::new(dir.path(), &policy).unwrap();
        let v = CommandValidator::new(&policy, guard);
        assert!(!v.validate("echo x > vendor/lib.rs").allowed);
        assert!(v.validate("cat vendor/lib.rs > copy.rs").allowed);
    }

    #[test]
    fn test_unparseable_command_is_parse_ambiguity() {
        let dir = TempDir::new().unwrap();
        let v = validator(&dir, allow(&["echo"]), &[]);
        let err = v.approve("echo 'unterminated").unwrap_err();
        assert!(matches!(err, ToolError::ParseAmbiguity { what: "command", .. }));
        assert!(err.to_string().starts_with("could not parse command: "));
    }

    #[test]
    fn test_policy_yaml_modes() {
        let yaml = "programs:\n  deny_list: [rm]\ndenied_dirs: []\n";
        let p: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(p.programs, ProgramPolicy::DenyList(vec!["rm".to_string()]));
        assert!(p.denied_dirs.is_empty());

        let p: PolicyConfig = serde_yaml::from_str("{}").unwrap();
        assert!(matches!(p.programs, ProgramPolicy::AllowList(_)));
        assert!(p.denied_dirs.contains(&"/etc".to_string()));
    }
}
