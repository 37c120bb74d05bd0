// Directive tags: `<bash>cmd</bash>`, `<read>path</read>`,
// `<write file="path">body</write>` and their synonyms. Parameters may also be
// given as attributes, and `<read path="x"/>` is accepted self-closing.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{normalize, unwrap_fence, Candidate, Operation, Scan, SourceSyntax};

static OPEN_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"<(bash|shell|execute|executor|exec|read_file|read|write_file|write|create_file|append_file|append)\b([^<>]*?)(/?)>",
    )
    .expect("valid open tag regex")
});

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s=/>"']+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute regex")
});

const FAMILY: SourceSyntax = SourceSyntax::DirectiveTag;

struct Tag<'a> {
    name: &'a str,
    start: usize,
    attributes: Vec<(&'a str, &'a str)>,
}

pub(crate) fn scan(text: &str, out: &mut Scan) {
    let mut from = 0;
    while let Some(open) = OPEN_TAG.captures_at(text, from) {
        let (Some(whole), Some(name)) = (open.get(0), open.get(1)) else {
            break;
        };
        let raw_attributes = open.get(2).map_or("", |m| m.as_str());
        let self_closing = open.get(3).is_some_and(|m| !m.as_str().is_empty());

        let (body, end) = if self_closing {
            ("", whole.end())
        } else {
            let closing = format!("</{}>", name.as_str());
            match text[whole.end()..].find(&closing) {
                Some(at) => {
                    let body_end = whole.end() + at;
                    (&text[whole.end()..body_end], body_end + closing.len())
                }
                None => {
                    out.warn(
                        whole.start(),
                        FAMILY,
                        format!(
                            "<{0}> tag is never closed with </{0}>; nothing after it was run",
                            name.as_str()
                        ),
                    );
                    // Unclosed: everything up to the end belongs to it.
                    out.candidates.push(Candidate {
                        span: whole.start()..text.len(),
                        family: FAMILY,
                        calls: Vec::new(),
                    });
                    break;
                }
            }
        };

        let tag = Tag {
            name: name.as_str(),
            start: whole.start(),
            attributes: parse_attributes(raw_attributes),
        };
        let calls = if attributes_are_sound(&tag, raw_attributes, out) {
            build_calls(&tag, body, out)
        } else {
            Vec::new()
        };
        out.candidates.push(Candidate {
            span: whole.start()..end,
            family: FAMILY,
            calls,
        });
        from = end;
    }
}

fn parse_attributes(raw: &str) -> Vec<(&str, &str)> {
    ATTRIBUTE
        .captures_iter(raw)
        .filter_map(|c| {
            let name = c.get(1)?.as_str();
            let value = c.get(2).or(c.get(3)).or(c.get(4)).map_or("", |m| m.as_str());
            Some((name, value))
        })
        .collect()
}

fn attributes_are_sound(tag: &Tag<'_>, raw: &str, out: &mut Scan) -> bool {
    let mut sound = true;
    for (name, _) in &tag.attributes {
        if !name.is_ascii() {
            out.warn(
                tag.start,
                FAMILY,
                format!(
                    "<{}> tag has a non-ASCII attribute name '{}'; it was not run",
                    tag.name, name
                ),
            );
            sound = false;
        }
    }
    if raw.contains('{') || raw.contains('}') {
        out.warn(
            tag.start,
            FAMILY,
            format!(
                "<{}> tag carries structured data in its attributes; use plain attributes or the tag body",
                tag.name
            ),
        );
        sound = false;
    }
    sound
}

fn build_calls(tag: &Tag<'_>, body: &str, out: &mut Scan) -> Vec<super::ToolCall> {
    let Some(operation) = normalize::operation_for(tag.name) else {
        return Vec::new();
    };
    let attributes = || {
        tag.attributes
            .iter()
            .map(|(k, v)| (normalize::canonical_key(k), v.to_string()))
    };
    let has = |key: &str| attributes().any(|(k, v)| k == key && !v.trim().is_empty());

    let mut params: Vec<Vec<(String, String)>> = Vec::new();
    match operation {
        Operation::Read if has(normalize::PATH) => params.push(attributes().collect()),
        Operation::Read => {
            for line in unwrap_fence(body).lines().map(str::trim).filter(|l| !l.is_empty()) {
                let mut p: Vec<_> = attributes().collect();
                p.push((normalize::PATH.to_string(), line.to_string()));
                params.push(p);
            }
        }
        Operation::Execute => {
            let mut p: Vec<_> = attributes().collect();
            p.push((normalize::COMMAND.to_string(), unwrap_fence(body).to_string()));
            params.push(p);
        }
        Operation::Write | Operation::Append => {
            if !has(normalize::PATH) {
                out.warn(
                    tag.start,
                    FAMILY,
                    format!(
                        "<{0}> tag has no file path; use <{0} file=\"PATH\">",
                        tag.name
                    ),
                );
                return Vec::new();
            }
            let mut p: Vec<_> = attributes().collect();
            p.push((normalize::CONTENT.to_string(), body.to_string()));
            params.push(p);
        }
    }

    let calls: Vec<_> = params
        .into_iter()
        .filter_map(|p| normalize::build_call(tag.name, p, FAMILY))
        .filter(|call| match call.operation {
            Operation::Execute => call.command().is_some(),
            _ => call.path().is_some(),
        })
        .collect();
    if calls.is_empty() {
        out.warn(
            tag.start,
            FAMILY,
            format!("<{}> tag is empty; nothing to do", tag.name),
        );
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(text: &str) -> (Vec<super::super::ToolCall>, usize) {
        let mut scan = Scan::default();
        super::scan(text, &mut scan);
        let calls = scan
            .candidates
            .into_iter()
            .flat_map(|c| c.calls)
            .collect();
        (calls, scan.findings.len())
    }

    #[test]
    fn test_command_tags() {
        let (calls, warnings) = calls("<bash>ls -la</bash> then <shell>pwd</shell>");
        assert_eq!(warnings, 0);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].command(), Some("ls -la"));
        assert_eq!(calls[1].command(), Some("pwd"));
    }

    #[test]
    fn test_exec_tag_keeps_heredoc() {
        let text = "<exec>cat > notes.md <<'EOF'\n- a | b\nEOF</exec>";
        let (calls, _) = calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].command(),
            Some("cat > notes.md <<'EOF'\n- a | b\nEOF")
        );
    }

    #[test]
    fn test_read_tags() {
        let (calls, _) = calls("<read>src/main.rs</read><read_file> Cargo.toml </read_file>");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].operation, Operation::Read);
        assert_eq!(calls[1].path(), Some("Cargo.toml"));
    }

    #[test]
    fn test_self_closing_read() {
        let (calls, warnings) = calls(r#"<read path="README.md"/>"#);
        assert_eq!(warnings, 0);
        assert_eq!(calls[0].path(), Some("README.md"));
    }

    #[test]
    fn test_write_tags() {
        let (calls, _) = calls(
            "<write file=\"a.txt\">\nalpha\n</write><write_file path='b.txt'>beta</write_file>",
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].path(), Some("a.txt"));
        assert_eq!(calls[0].content(), Some("alpha\n"));
        assert_eq!(calls[1].operation, Operation::Write);
        assert_eq!(calls[1].content(), Some("beta"));
    }

    #[test]
    fn test_append_tag() {
        let (calls, _) = calls("<append file=\"log.md\">- done\n</append>");
        assert_eq!(calls[0].operation, Operation::Append);
        assert_eq!(calls[0].content(), Some("- done\n"));
    }

    #[test]
    fn test_write_without_path_warns() {
        let (calls, warnings) = calls("<write>orphan text</write>");
        assert!(calls.is_empty());
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_non_ascii_attribute_warns() {
        let (calls, warnings) = calls("<write fïle=\"x.txt\">data</write>");
        assert!(calls.is_empty());
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_structured_attribute_warns() {
        let (calls, warnings) = calls(r#"<write file={"path": "x.txt"}>data</write>"#);
        assert!(calls.is_empty());
        assert!(warnings >= 1);
    }

    #[test]
    fn test_unterminated_tag_warns() {
        let (calls, warnings) = calls("<bash>rm -rf target");
        assert!(calls.is_empty());
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_lookalike_tags_ignored() {
        let (calls, warnings) = calls("<reader>x</reader> <bashful>y</bashful>");
        assert!(calls.is_empty());
        assert_eq!(warnings, 0);
    }
}
