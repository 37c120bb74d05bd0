// Tool-call extraction from free-form agent output.
//
// Every syntax family scans the whole text and reports candidates: a byte span
// plus the calls found inside it. Spans are then claimed outermost-first and a
// candidate overlapping an already claimed span is discarded, so one region of
// text can never produce calls through two parsers. Surviving calls are
// deduplicated on (operation, parameters), keeping the first.

mod fenced;
mod invoke;
pub(crate) mod normalize;
mod tags;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Range;

use serde::Serialize;

/// The four canonical operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Read,
    Write,
    Append,
    Execute,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Append => "APPEND",
            Self::Execute => "EXECUTE",
        })
    }
}

/// Which textual format a call was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSyntax {
    /// `<function_calls>` block of `<invoke>` elements.
    InvokeBlock,
    /// `<bash>`, `<read>`, `<write file=..>` and their synonyms.
    DirectiveTag,
    /// Code fence labelled `bash`, `sh` or `shell`.
    ShellFence,
    /// Native `READ`, `WRITE` or `EXEC` fence.
    NativeFence,
}

/// A normalized request extracted from agent text. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    pub operation: Operation,
    pub parameters: BTreeMap<String, String>,
    pub source: SourceSyntax,
}

impl ToolCall {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.get(normalize::PATH).filter(|p| !p.is_empty())
    }

    pub fn content(&self) -> Option<&str> {
        self.get(normalize::CONTENT)
    }

    pub fn command(&self) -> Option<&str> {
        self.get(normalize::COMMAND).filter(|c| !c.is_empty())
    }

    /// Per-call timeout in seconds (`"30"` or `"30s"`).
    pub fn timeout_secs(&self) -> Option<u64> {
        let raw = self.get(normalize::TIMEOUT)?;
        raw.trim().trim_end_matches('s').trim().parse().ok()
    }

    /// One-line description, e.g. `READ src/main.rs`.
    pub fn summary(&self) -> String {
        let target = match self.operation {
            Operation::Execute => self.command().unwrap_or(""),
            _ => self.path().unwrap_or(""),
        };
        let first_line = target.lines().next().unwrap_or("");
        let mut summary = format!("{} {}", self.operation, first_line);
        if first_line.chars().count() > 80 {
            summary = format!(
                "{} {}...",
                self.operation,
                first_line.chars().take(80).collect::<String>()
            );
        } else if target.contains('\n') {
            summary.push_str(" ...");
        }
        summary
    }

    fn dedup_key(&self) -> (Operation, BTreeMap<String, String>) {
        (self.operation, self.parameters.clone())
    }
}

/// An advisory about a malformed fragment. Never executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// 1-based line of the fragment.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WARNING (line {}): {}", self.line, self.message)
    }
}

/// Result of scanning one agent response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    pub calls: Vec<ToolCall>,
    pub warnings: Vec<Warning>,
}

/// A region of text claimed by one syntax family.
#[derive(Debug)]
pub(crate) struct Candidate {
    pub span: Range<usize>,
    pub family: SourceSyntax,
    pub calls: Vec<ToolCall>,
}

/// A warning before line numbers are assigned.
#[derive(Debug)]
pub(crate) struct Finding {
    pub offset: usize,
    pub family: SourceSyntax,
    pub message: String,
}

#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub candidates: Vec<Candidate>,
    pub findings: Vec<Finding>,
}

impl Scan {
    pub(crate) fn warn(&mut self, offset: usize, family: SourceSyntax, message: impl Into<String>) {
        self.findings.push(Finding {
            offset,
            family,
            message: message.into(),
        });
    }
}

/// Extract every tool call from `text`, in order of appearance, deduplicated.
pub fn extract(text: &str) -> Extraction {
    let mut scan = Scan::default();
    invoke::scan(text, &mut scan);
    tags::scan(text, &mut scan);
    fenced::scan(text, &mut scan);

    let Scan {
        mut candidates,
        findings,
    } = scan;

    // Outermost first: earliest start, then longest span.
    candidates.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then(b.span.end.cmp(&a.span.end))
    });

    let mut claimed: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if let Some(last) = claimed.last() {
            if candidate.span.start < last.span.end {
                tracing::debug!(
                    family = ?candidate.family,
                    start = candidate.span.start,
                    "candidate overlaps a claimed span, discarded"
                );
                continue;
            }
        }
        claimed.push(candidate);
    }

    let mut seen = HashSet::new();
    let mut calls = Vec::new();
    for call in claimed.iter().flat_map(|c| c.calls.iter()) {
        if seen.insert(call.dedup_key()) {
            calls.push(call.clone());
        }
    }

    let mut findings: Vec<Finding> = findings
        .into_iter()
        .filter(|f| {
            !claimed
                .iter()
                .any(|c| c.family != f.family && c.span.contains(&f.offset))
        })
        .collect();
    findings.sort_by_key(|f| f.offset);
    let warnings = findings
        .into_iter()
        .map(|f| Warning {
            line: line_of(text, f.offset),
            message: f.message,
        })
        .collect();

    tracing::debug!(calls = calls.len(), regions = claimed.len(), "extracted tool calls");
    Extraction { calls, warnings }
}

/// 1-based line number of a byte offset.
pub(crate) fn line_of(text: &str, offset: usize) -> usize {
    let end = offset.min(text.len());
    text.as_bytes()[..end].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Body text with one surrounding code fence removed, trimmed.
pub(crate) fn unwrap_fence(body: &str) -> &str {
    let trimmed = body.trim();
    let Some(inner) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return trimmed;
    };
    match inner.split_once('\n') {
        Some((_info, rest)) => rest.trim(),
        None => inner.trim(),
    }
}
