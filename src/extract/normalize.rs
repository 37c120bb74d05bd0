// Spelling tables: every tool name and parameter key an agent has been seen to
// emit, mapped onto the four canonical operations and three logical keys.

use std::collections::BTreeMap;

use super::{Operation, SourceSyntax, ToolCall};

pub(crate) const PATH: &str = "path";
pub(crate) const CONTENT: &str = "content";
pub(crate) const COMMAND: &str = "command";
pub(crate) const TIMEOUT: &str = "timeout";

const OPERATIONS: &[(&str, Operation)] = &[
    ("read", Operation::Read),
    ("read_file", Operation::Read),
    ("readfile", Operation::Read),
    ("cat", Operation::Read),
    ("get_file", Operation::Read),
    ("view", Operation::Read),
    ("view_file", Operation::Read),
    ("open_file", Operation::Read),
    ("write", Operation::Write),
    ("write_file", Operation::Write),
    ("writefile", Operation::Write),
    ("create_file", Operation::Write),
    ("save_file", Operation::Write),
    ("put_file", Operation::Write),
    ("append", Operation::Append),
    ("append_file", Operation::Append),
    ("append_to_file", Operation::Append),
    ("bash", Operation::Execute),
    ("shell", Operation::Execute),
    ("sh", Operation::Execute),
    ("exec", Operation::Execute),
    ("execute", Operation::Execute),
    ("executor", Operation::Execute),
    ("run", Operation::Execute),
    ("run_command", Operation::Execute),
    ("run_shell", Operation::Execute),
    ("execute_command", Operation::Execute),
    ("terminal", Operation::Execute),
];

const KEYS: &[(&str, &str)] = &[
    ("path", PATH),
    ("file", PATH),
    ("file_path", PATH),
    ("filepath", PATH),
    ("filename", PATH),
    ("file_name", PATH),
    ("target", PATH),
    ("target_file", PATH),
    ("content", CONTENT),
    ("contents", CONTENT),
    ("text", CONTENT),
    ("body", CONTENT),
    ("data", CONTENT),
    ("file_text", CONTENT),
    ("command", COMMAND),
    ("cmd", COMMAND),
    ("script", COMMAND),
    ("code", COMMAND),
    ("timeout", TIMEOUT),
    ("timeout_secs", TIMEOUT),
    ("timeout_seconds", TIMEOUT),
];

/// Canonical operation for a tool name, if it is one.
pub(crate) fn operation_for(name: &str) -> Option<Operation> {
    let name = name.trim().to_ascii_lowercase().replace('-', "_");
    OPERATIONS
        .iter()
        .find(|(spelling, _)| *spelling == name)
        .map(|(_, op)| *op)
}

/// Canonical parameter key. Unknown keys are kept, lowercased.
pub(crate) fn canonical_key(key: &str) -> String {
    let key = key.trim().to_ascii_lowercase().replace('-', "_");
    KEYS.iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or(key)
}

/// Normalize one value for its canonical key.
fn normalize_value(key: &str, value: &str) -> String {
    match key {
        PATH | COMMAND | TIMEOUT => value.trim().to_string(),
        CONTENT => value.strip_prefix('\n').unwrap_or(value).to_string(),
        _ => value.to_string(),
    }
}

/// Build a call from a tool name and raw parameters. Unknown names are prose,
/// not calls, and yield `None`. The first value wins when two aliases collide.
pub(crate) fn build_call<I, K, V>(name: &str, params: I, source: SourceSyntax) -> Option<ToolCall>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let operation = operation_for(name)?;
    let mut parameters = BTreeMap::new();
    for (key, value) in params {
        let key = canonical_key(key.as_ref());
        let value = normalize_value(&key, value.as_ref());
        parameters.entry(key).or_insert(value);
    }
    Some(ToolCall {
        operation,
        parameters,
        source,
    })
}
