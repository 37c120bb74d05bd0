// Code fences. A fence labelled `bash`, `sh` or `shell` yields one EXECUTE per
// command line, keeping here-documents and `\` continuations whole. The native
// `READ`, `WRITE` and `EXEC` fences take an inline argument on the opening line
// and/or a body; they may also be written on one line: ```READ src/lib.rs```.
//
// Both kinds come from a single pass over the fences in the text, so a block is
// classified exactly once.

use std::collections::VecDeque;

use super::{normalize, Candidate, Scan, SourceSyntax, ToolCall};
use crate::tools::command::{heredoc_markers, HeredocMarker};

const SHELL_LANGUAGES: &[&str] = &["bash", "sh", "shell"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Native {
    Read,
    Write,
    Exec,
}

impl Native {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "READ" => Some(Self::Read),
            "WRITE" => Some(Self::Write),
            "EXEC" => Some(Self::Exec),
            _ => None,
        }
    }

    fn tool_name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exec => "exec",
        }
    }
}

enum Kind {
    Shell,
    Native(Native),
    Other,
}

/// A line of text with its byte offset.
#[derive(Clone, Copy)]
struct Line<'a> {
    offset: usize,
    text: &'a str,
}

fn lines_with_offsets(text: &str) -> Vec<Line<'_>> {
    let mut offset = 0;
    text.split_inclusive('\n')
        .map(|raw| {
            let line = Line {
                offset,
                text: raw.strip_suffix('\n').unwrap_or(raw).trim_end_matches('\r'),
            };
            offset += raw.len();
            line
        })
        .collect()
}

/// Length of the backtick run opening `line`, if it is a fence line.
fn fence_ticks(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    let ticks = trimmed.chars().take_while(|&c| c == '`').count();
    (ticks >= 3).then_some(ticks)
}

fn classify(info: &str) -> (Kind, &str) {
    let info = info.trim();
    let (word, rest) = info
        .split_once(char::is_whitespace)
        .map_or((info, ""), |(w, r)| (w, r.trim()));
    if let Some(native) = Native::parse(word) {
        return (Kind::Native(native), rest);
    }
    if SHELL_LANGUAGES.contains(&word.to_ascii_lowercase().as_str()) {
        return (Kind::Shell, rest);
    }
    (Kind::Other, rest)
}

pub(crate) fn scan(text: &str, out: &mut Scan) {
    let lines = lines_with_offsets(text);
    let mut i = 0;
    while i < lines.len() {
        let open = lines[i];
        let Some(ticks) = fence_ticks(open.text) else {
            i += 1;
            continue;
        };
        let fence = "`".repeat(ticks);
        let info = &open.text.trim_start()[ticks..];
        let span_start = open.offset;

        // One-line form: ```READ path```
        if let Some(inner) = info.trim_end().strip_suffix(fence.as_str()) {
            if let (Kind::Native(native), argument) = classify(inner) {
                let calls = native_calls(native, argument, &[], open.offset, out);
                out.candidates.push(Candidate {
                    span: span_start..open.offset + open.text.len(),
                    family: SourceSyntax::NativeFence,
                    calls,
                });
            }
            i += 1;
            continue;
        }

        let close = (i + 1..lines.len()).find(|&j| {
            let t = lines[j].text.trim();
            t.len() >= ticks && t.chars().all(|c| c == '`')
        });
        let (kind, argument) = classify(info);

        let Some(close) = close else {
            match kind {
                Kind::Shell | Kind::Native(_) => {
                    out.warn(
                        open.offset,
                        family_of(&kind),
                        format!(
                            "code block opened with {} is never closed; it was not run",
                            open.text.trim()
                        ),
                    );
                    out.candidates.push(Candidate {
                        span: span_start..text.len(),
                        family: family_of(&kind),
                        calls: Vec::new(),
                    });
                }
                Kind::Other => {}
            }
            return;
        };

        let body = &lines[i + 1..close];
        let span = span_start..lines[close].offset + lines[close].text.len();
        match kind {
            Kind::Shell => {
                let calls = shell_calls(body, out);
                out.candidates.push(Candidate {
                    span,
                    family: SourceSyntax::ShellFence,
                    calls,
                });
            }
            Kind::Native(native) => {
                let calls = native_calls(native, argument, body, open.offset, out);
                out.candidates.push(Candidate {
                    span,
                    family: SourceSyntax::NativeFence,
                    calls,
                });
            }
            Kind::Other => {}
        }
        i = close + 1;
    }
}

fn family_of(kind: &Kind) -> SourceSyntax {
    match kind {
        Kind::Native(_) => SourceSyntax::NativeFence,
        _ => SourceSyntax::ShellFence,
    }
}

fn exec_call(command: &str, source: SourceSyntax) -> Option<ToolCall> {
    normalize::build_call("exec", [(normalize::COMMAND, command)], source)
        .filter(|call| call.command().is_some())
}

/// Split a shell block into commands.
fn shell_calls(body: &[Line<'_>], out: &mut Scan) -> Vec<ToolCall> {
    const FAMILY: SourceSyntax = SourceSyntax::ShellFence;
    let mut calls = Vec::new();
    let mut pending = String::new();
    let mut heredoc: Option<(String, VecDeque<HeredocMarker>, usize)> = None;

    for line in body {
        if let Some((command, markers, _)) = heredoc.as_mut() {
            command.push('\n');
            command.push_str(line.text);
            if markers.front().is_some_and(|m| m.closes(line.text)) {
                markers.pop_front();
            }
            if markers.is_empty() {
                if let Some((command, _, _)) = heredoc.take() {
                    calls.extend(exec_call(&command, FAMILY));
                }
            }
            continue;
        }

        let trimmed = line.text.trim();
        if pending.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }

        let text = line.text.trim_end();
        if let Some(joined) = text.strip_suffix('\\').filter(|t| !t.ends_with('\\')) {
            pending.push_str(joined);
            continue;
        }
        pending.push_str(text);
        let command = std::mem::take(&mut pending);

        let markers: VecDeque<HeredocMarker> = heredoc_markers(&command).into();
        if markers.is_empty() {
            calls.extend(exec_call(&command, FAMILY));
        } else {
            heredoc = Some((command, markers, line.offset));
        }
    }

    if let Some((_, markers, offset)) = heredoc {
        let delimiters: Vec<&str> = markers.iter().map(|m| m.delimiter.as_str()).collect();
        out.warn(
            offset,
            FAMILY,
            format!(
                "here-document never closed (expected a line with {}); the command was not run",
                delimiters.join(", ")
            ),
        );
    }
    if !pending.is_empty() {
        calls.extend(exec_call(&pending, FAMILY));
    }
    calls
}

fn native_calls(
    native: Native,
    argument: &str,
    body: &[Line<'_>],
    offset: usize,
    out: &mut Scan,
) -> Vec<ToolCall> {
    const FAMILY: SourceSyntax = SourceSyntax::NativeFence;
    let name = native.tool_name();
    let body_text = body.iter().map(|l| l.text).collect::<Vec<_>>().join("\n");

    let calls: Vec<ToolCall> = match native {
        Native::Read => std::iter::once(argument)
            .chain(body.iter().map(|l| l.text))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter_map(|p| normalize::build_call(name, [(normalize::PATH, p)], FAMILY))
            .collect(),
        Native::Write => {
            if argument.is_empty() {
                out.warn(
                    offset,
                    FAMILY,
                    "WRITE block has no target path; put it after WRITE on the opening line",
                );
                return Vec::new();
            }
            let content = if body.is_empty() {
                String::new()
            } else {
                format!("{body_text}\n")
            };
            normalize::build_call(
                name,
                [(normalize::PATH, argument), (normalize::CONTENT, content.as_str())],
                FAMILY,
            )
            .into_iter()
            .collect()
        }
        Native::Exec => [argument, body_text.as_str()]
            .into_iter()
            .filter_map(|command| exec_call(command, FAMILY))
            .collect(),
    };

    if calls.is_empty() {
        out.warn(offset, FAMILY, format!("{} block is empty", name.to_uppercase()));
    }
    calls
}
