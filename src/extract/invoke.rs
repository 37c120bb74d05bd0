// `<function_calls>` blocks: one or more `<invoke name="..">` elements, each
// with `<parameter name="..">value</parameter>` children.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{normalize, unwrap_fence, Candidate, Scan, SourceSyntax, ToolCall};

static BLOCK_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(?:[A-Za-z_]+:)?function_calls\s*>").expect("valid block open regex")
});

static BLOCK_CLOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"</(?:[A-Za-z_]+:)?function_calls\s*>").expect("valid block close regex")
});

static INVOKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<(?:[A-Za-z_]+:)?invoke\s+name\s*=\s*["']([^"']*)["']\s*>(.*?)</(?:[A-Za-z_]+:)?invoke\s*>"#,
    )
    .expect("valid invoke regex")
});

static INVOKE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(?:[A-Za-z_]+:)?invoke\b").expect("valid invoke open regex"));

static PARAMETER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<(?:[A-Za-z_]+:)?parameter\s+name\s*=\s*["']([^"']*)["']\s*>(.*?)</(?:[A-Za-z_]+:)?parameter\s*>"#,
    )
    .expect("valid parameter regex")
});

const FAMILY: SourceSyntax = SourceSyntax::InvokeBlock;

pub(crate) fn scan(text: &str, out: &mut Scan) {
    let mut from = 0;
    while let Some(open) = BLOCK_OPEN.find_at(text, from) {
        let Some(close) = BLOCK_CLOSE.find_at(text, open.end()) else {
            out.warn(
                open.start(),
                FAMILY,
                "<function_calls> block is never closed; nothing in it was run",
            );
            // Claim the rest so nothing inside runs through another syntax.
            out.candidates.push(Candidate {
                span: open.start()..text.len(),
                family: FAMILY,
                calls: Vec::new(),
            });
            return;
        };

        let body = &text[open.end()..close.start()];
        let calls = parse_invocations(body, open.end(), out);
        out.candidates.push(Candidate {
            span: open.start()..close.end(),
            family: FAMILY,
            calls,
        });
        from = close.end();
    }
}

fn parse_invocations(body: &str, base: usize, out: &mut Scan) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut complete = 0;
    for invoke in INVOKE.captures_iter(body) {
        complete += 1;
        let name = &invoke[1];
        let inner = &invoke[2];
        let params: Vec<(String, String)> = PARAMETER
            .captures_iter(inner)
            .map(|p| {
                let key = normalize::canonical_key(&p[1]);
                let value = if key == normalize::CONTENT {
                    p[2].to_string()
                } else {
                    unwrap_fence(&p[2]).to_string()
                };
                (key, value)
            })
            .collect();

        match normalize::build_call(name, params, FAMILY) {
            Some(call) => calls.push(call),
            None => tracing::debug!(name, "ignoring invoke of unknown tool"),
        }
    }

    let opened = INVOKE_OPEN.find_iter(body).count();
    if opened > complete {
        let offset = INVOKE_OPEN
            .find_iter(body)
            .nth(complete)
            .map_or(base, |m| base + m.start());
        out.warn(
            offset,
            FAMILY,
            format!(
                "{} <invoke> element(s) are malformed or never closed and were skipped",
                opened - complete
            ),
        );
    }
    calls
}
