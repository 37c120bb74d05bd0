// Shell command analysis for validation.
//
// This is not a shell. It understands just enough of the grammar agents emit
// (pipes, `&&`/`||`/`;`, redirections, quoting, subshells, here-documents and
// command substitution) to answer two questions: which programs would this
// command run, and which path-like operands does it mention.
//
// Here-document bodies are removed from a private copy before lexing so body
// text such as `- a | b` is never read as syntax. That copy is a
// `ValidationCopy`, which can only be read; what runs is always the original
// string.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_NESTING: usize = 8;

/// Reserved words that may precede a command without being one.
const KEYWORDS: &[&str] = &[
    "!", "{", "}", "if", "then", "else", "elif", "fi", "while", "until", "do", "done", "esac",
    "time",
];

/// Reserved words that start a segment with no program of its own.
const SEGMENT_KEYWORDS: &[&str] = &["for", "case", "select"];

static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\+?=").expect("valid assignment regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(&'static str),
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("redirection '{0}' has no target")]
    MissingRedirectTarget(String),
    #[error("unterminated command substitution")]
    UnterminatedSubstitution,
    #[error("command substitutions nested too deeply")]
    NestingTooDeep,
}

/// Heredoc-stripped copy of a command. Read-only; never executed.
#[derive(Debug)]
pub(crate) struct ValidationCopy(String);

impl ValidationCopy {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

/// What a command string would do, as far as validation is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandAnalysis {
    /// Base names of every invoked program, in order of appearance.
    pub programs: Vec<String>,
    /// Quote-removed arguments, assignment values and redirection targets.
    pub operands: Vec<String>,
    /// Targets of output redirections (`>`, `>>`, `&>`, `2>`, ...).
    pub write_targets: Vec<String>,
}

/// Base names of every program `raw` would invoke.
pub fn extract_program_names(raw: &str) -> Result<Vec<String>, CommandParseError> {
    Ok(analyze(raw)?.programs)
}

/// Programs and operands of `raw`.
pub fn analyze(raw: &str) -> Result<CommandAnalysis, CommandParseError> {
    analyze_nested(raw, 0)
}

fn analyze_nested(raw: &str, depth: usize) -> Result<CommandAnalysis, CommandParseError> {
    if depth > MAX_NESTING {
        return Err(CommandParseError::NestingTooDeep);
    }
    let copy = strip_heredoc_bodies(raw);
    let tokens = Lexer::new(copy.as_str()).tokens()?;
    walk(tokens, depth)
}

// ── Here-documents ──────────────────────────────────────────────────────────

/// A here-document introducer (`<<EOF`, `<<-'EOF'`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeredocMarker {
    pub delimiter: String,
    pub strip_tabs: bool,
}

impl HeredocMarker {
    /// Whether `line` terminates this here-document. Surrounding whitespace is
    /// ignored so the body never extends past where a shell would end it.
    pub(crate) fn closes(&self, line: &str) -> bool {
        line.trim() == self.delimiter
    }
}

struct HeredocScan {
    output: String,
    unclosed: Vec<HeredocMarker>,
}

/// Remove every here-document body from `raw`, keeping the introducer lines,
/// and collapse here-strings to an empty placeholder.
pub(crate) fn strip_heredoc_bodies(raw: &str) -> ValidationCopy {
    ValidationCopy(scan_heredocs(raw).output)
}

/// Here-documents introduced in `line` (which should hold no newline). Their
/// bodies start on the following line.
pub(crate) fn heredoc_markers(line: &str) -> Vec<HeredocMarker> {
    scan_heredocs(line).unclosed
}

fn scan_heredocs(text: &str) -> HeredocScan {
    let chars: Vec<char> = text.chars().collect();
    let mut output = String::with_capacity(text.len());
    let mut pending: Vec<HeredocMarker> = Vec::new();
    let mut unclosed = Vec::new();
    let mut quote: Option<char> = None;
    // Paren depth inside `$((...))` or `((...))`, where `<<` is a shift.
    let mut arithmetic = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if arithmetic > 0 {
            match c {
                '(' => arithmetic += 1,
                ')' => arithmetic -= 1,
                _ => {}
            }
            output.push(c);
            i += 1;
            continue;
        }

        if let Some(q) = quote {
            output.push(c);
            if q != '\'' && c == '\\' && i + 1 < chars.len() {
                output.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                output.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    output.push(next);
                }
                i += 2;
            }
            '\'' | '"' | '`' => {
                quote = Some(c);
                output.push(c);
                i += 1;
            }
            '$' if chars.get(i + 1) == Some(&'(') && chars.get(i + 2) == Some(&'(') => {
                output.push_str("$((");
                arithmetic = 2;
                i += 3;
            }
            '(' if chars.get(i + 1) == Some(&'(') && at_word_start(&chars, i) => {
                output.push_str("((");
                arithmetic = 2;
                i += 2;
            }
            '#' if at_word_start(&chars, i) => {
                while i < chars.len() && chars[i] != '\n' {
                    output.push(chars[i]);
                    i += 1;
                }
            }
            '\n' => {
                output.push('\n');
                i += 1;
                if !pending.is_empty() {
                    i = skip_bodies(&chars, i, &mut pending, &mut unclosed);
                }
            }
            '<' if chars.get(i + 1) == Some(&'<') && chars.get(i + 2) == Some(&'<') => {
                output.push_str("<<< ''");
                i = skip_here_string_word(&chars, i + 3);
            }
            '<' if chars.get(i + 1) == Some(&'<') => match parse_introducer(&chars, i) {
                Some((marker, end)) => {
                    output.extend(&chars[i..end]);
                    pending.push(marker);
                    i = end;
                }
                None => {
                    output.push_str("<<");
                    i += 2;
                }
            },
            _ => {
                output.push(c);
                i += 1;
            }
        }
    }

    unclosed.extend(pending);
    HeredocScan { output, unclosed }
}

fn at_word_start(chars: &[char], i: usize) -> bool {
    i == 0
        || matches!(
            chars[i - 1],
            ' ' | '\t' | '\n' | ';' | '&' | '|' | '(' | ')'
        )
}

/// Consume the bodies of `pending` here-documents starting at `i` (the first
/// character after the introducer line). Returns the index after the last
/// closing line.
fn skip_bodies(
    chars: &[char],
    mut i: usize,
    pending: &mut Vec<HeredocMarker>,
    unclosed: &mut Vec<HeredocMarker>,
) -> usize {
    for marker in pending.drain(..) {
        let mut closed = false;
        while i < chars.len() {
            let end = chars[i..]
                .iter()
                .position(|&c| c == '\n')
                .map_or(chars.len(), |p| i + p);
            let line: String = chars[i..end].iter().collect();
            i = (end + 1).min(chars.len());
            if marker.closes(&line) {
                closed = true;
                break;
            }
        }
        if !closed {
            unclosed.push(marker);
        }
    }
    i
}

fn parse_introducer(chars: &[char], start: usize) -> Option<(HeredocMarker, usize)> {
    let mut i = start + 2;
    let strip_tabs = chars.get(i) == Some(&'-');
    if strip_tabs {
        i += 1;
    }
    while matches!(chars.get(i), Some(' ' | '\t')) {
        i += 1;
    }

    let mut delimiter = String::new();
    match chars.get(i) {
        Some(&q @ ('\'' | '"')) => {
            i += 1;
            loop {
                let &c = chars.get(i)?;
                i += 1;
                if c == q {
                    break;
                }
                delimiter.push(c);
            }
        }
        Some(&c) if c.is_alphabetic() || c == '_' || c == '\\' => {
            while let Some(&c) = chars.get(i) {
                if c.is_whitespace() || "|&;<>()".contains(c) {
                    break;
                }
                if !matches!(c, '\\' | '\'' | '"') {
                    delimiter.push(c);
                }
                i += 1;
            }
        }
        _ => return None,
    }

    if delimiter.is_empty() {
        return None;
    }
    Some((
        HeredocMarker {
            delimiter,
            strip_tabs,
        },
        i,
    ))
}

fn skip_here_string_word(chars: &[char], mut i: usize) -> usize {
    while matches!(chars.get(i), Some(' ' | '\t')) {
        i += 1;
    }
    let mut quote: Option<char> = None;
    while let Some(&c) = chars.get(i) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() || "|&;<>()".contains(c) => break,
            None => {}
        }
        i += 1;
    }
    i
}

// ── Lexer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Word {
    text: String,
    substitutions: Vec<String>,
    quoted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(Word),
    Separator(&'static str),
    OpenParen,
    CloseParen,
    Redirect { op: String, target: Option<Word> },
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_blanks(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => self.pos += 1,
                Some('\\') if self.peek_at(1) == Some('\n') => self.pos += 2,
                _ => break,
            }
        }
    }

    fn tokens(mut self) -> Result<Vec<Token>, CommandParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_blanks();
            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    tokens.push(Token::Separator("\n"));
                }
                ';' => {
                    self.pos += 1;
                    tokens.push(Token::Separator(";"));
                }
                '&' if self.peek_at(1) == Some('&') => {
                    self.pos += 2;
                    tokens.push(Token::Separator("&&"));
                }
                '&' if self.peek_at(1) == Some('>') => tokens.push(self.redirect(String::new())?),
                '&' => {
                    self.pos += 1;
                    tokens.push(Token::Separator("&"));
                }
                '|' if self.peek_at(1) == Some('|') => {
                    self.pos += 2;
                    tokens.push(Token::Separator("||"));
                }
                '|' if self.peek_at(1) == Some('&') => {
                    self.pos += 2;
                    tokens.push(Token::Separator("|&"));
                }
                '|' => {
                    self.pos += 1;
                    tokens.push(Token::Separator("|"));
                }
                '(' => {
                    self.pos += 1;
                    tokens.push(Token::OpenParen);
                }
                ')' => {
                    self.pos += 1;
                    tokens.push(Token::CloseParen);
                }
                '<' | '>' if self.peek_at(1) == Some('(') => tokens.push(Token::Word(self.word()?)),
                '<' | '>' => tokens.push(self.redirect(String::new())?),
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                _ => {
                    let word = self.word()?;
                    let is_fd = !word.quoted
                        && !word.text.is_empty()
                        && word.text.chars().all(|c| c.is_ascii_digit())
                        && matches!(self.peek(), Some('<' | '>'));
                    if is_fd {
                        tokens.push(self.redirect(word.text)?);
                    } else {
                        tokens.push(Token::Word(word));
                    }
                }
            }
        }
        Ok(tokens)
    }

    fn redirect(&mut self, fd: String) -> Result<Token, CommandParseError> {
        let mut op = fd;
        let (a, b, c) = (self.peek(), self.peek_at(1), self.peek_at(2));
        let len = match (a, b, c) {
            (Some('&'), Some('>'), Some('>')) => 3,
            (Some('&'), Some('>'), _) => 2,
            (Some('<'), Some('<'), Some('<' | '-')) => 3,
            (Some('<'), Some('<' | '>' | '&'), _) => 2,
            (Some('>'), Some('>' | '|' | '&'), _) => 2,
            _ => 1,
        };
        for _ in 0..len {
            if let Some(ch) = self.peek() {
                op.push(ch);
                self.pos += 1;
            }
        }

        if op.ends_with('&') && self.peek().is_some_and(|c| c.is_ascii_digit() || c == '-') {
            while let Some(ch) = self.peek().filter(|c| c.is_ascii_digit() || *c == '-') {
                op.push(ch);
                self.pos += 1;
            }
            return Ok(Token::Redirect { op, target: None });
        }

        self.skip_blanks();
        match self.peek() {
            None | Some('\n' | ';' | '|' | '&' | '(' | ')' | '<' | '>') => {
                Err(CommandParseError::MissingRedirectTarget(op))
            }
            Some(_) => {
                let target = self.word()?;
                Ok(Token::Redirect {
                    op,
                    target: Some(target),
                })
            }
        }
    }

    fn word(&mut self) -> Result<Word, CommandParseError> {
        let mut word = Word::default();
        let mut started = false;
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' | ';' | '&' | '|' | '(' | ')' => break,
                '<' | '>' if !started && self.peek_at(1) == Some('(') => {
                    self.pos += 1;
                    let inner = self.balanced_parens()?;
                    word.text.push(c);
                    word.text.push_str(&format!("({inner})"));
                    word.substitutions.push(inner);
                }
                '<' | '>' => break,
                '\'' => {
                    self.pos += 1;
                    let start = self.pos;
                    let close = self.chars[start..]
                        .iter()
                        .position(|&c| c == '\'')
                        .ok_or(CommandParseError::UnterminatedQuote("single"))?;
                    word.text.extend(&self.chars[start..start + close]);
                    self.pos = start + close + 1;
                    word.quoted = true;
                }
                '"' => {
                    self.pos += 1;
                    self.double_quoted(&mut word)?;
                    word.quoted = true;
                }
                '`' => {
                    self.pos += 1;
                    let inner = self.backticks()?;
                    word.text.push_str(&format!("`{inner}`"));
                    word.substitutions.push(inner);
                }
                '$' if self.peek_at(1) == Some('(') => {
                    self.pos += 1;
                    let arithmetic = self.peek_at(1) == Some('(');
                    let inner = self.balanced_parens()?;
                    word.text.push_str(&format!("$({inner})"));
                    if !arithmetic {
                        word.substitutions.push(inner);
                    }
                }
                '\\' => {
                    self.pos += 1;
                    match self.peek() {
                        Some('\n') => self.pos += 1,
                        Some(next) => {
                            word.text.push(next);
                            self.pos += 1;
                        }
                        None => {}
                    }
                }
                _ => {
                    word.text.push(c);
                    self.pos += 1;
                }
            }
            started = true;
        }
        Ok(word)
    }

    fn double_quoted(&mut self, word: &mut Word) -> Result<(), CommandParseError> {
        loop {
            let c = self
                .peek()
                .ok_or(CommandParseError::UnterminatedQuote("double"))?;
            match c {
                '"' => {
                    self.pos += 1;
                    return Ok(());
                }
                '\\' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(next @ ('"' | '\\' | '$' | '`')) => {
                            word.text.push(next);
                            self.pos += 1;
                        }
                        Some('\n') => self.pos += 1,
                        _ => word.text.push('\\'),
                    }
                }
                '`' => {
                    self.pos += 1;
                    let inner = self.backticks()?;
                    word.text.push_str(&format!("`{inner}`"));
                    word.substitutions.push(inner);
                }
                '$' if self.peek_at(1) == Some('(') => {
                    self.pos += 1;
                    let arithmetic = self.peek_at(1) == Some('(');
                    let inner = self.balanced_parens()?;
                    word.text.push_str(&format!("$({inner})"));
                    if !arithmetic {
                        word.substitutions.push(inner);
                    }
                }
                _ => {
                    word.text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn backticks(&mut self) -> Result<String, CommandParseError> {
        let mut inner = String::new();
        loop {
            let c = self
                .peek()
                .ok_or(CommandParseError::UnterminatedQuote("backtick"))?;
            self.pos += 1;
            match c {
                '`' => return Ok(inner),
                '\\' if self.peek() == Some('`') => {
                    inner.push('`');
                    self.pos += 1;
                }
                _ => inner.push(c),
            }
        }
    }

    /// Consume a parenthesized group starting at the current `(` and return
    /// its contents.
    fn balanced_parens(&mut self) -> Result<String, CommandParseError> {
        self.pos += 1;
        let start = self.pos;
        let mut depth = 1usize;
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            self.pos += 1;
            match quote {
                Some('\'') if c == '\'' => quote = None,
                Some('\'') => {}
                Some(_) if c == '\\' => self.pos += 1,
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None => match c {
                    '\\' => self.pos += 1,
                    '\'' | '"' | '`' => quote = Some(c),
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(self.chars[start..self.pos - 1].iter().collect());
                        }
                    }
                    _ => {}
                },
            }
        }
        Err(CommandParseError::UnterminatedSubstitution)
    }
}

// ── Segment walk ────────────────────────────────────────────────────────────

fn walk(tokens: Vec<Token>, depth: usize) -> Result<CommandAnalysis, CommandParseError> {
    let mut analysis = CommandAnalysis::default();
    let mut at_start = true;
    let mut skip_segment = false;
    let mut function_name = false;
    let mut parens = 0i32;
    let mut i = 0;

    while let Some(token) = tokens.get(i).cloned() {
        i += 1;
        match token {
            Token::Separator(_) | Token::OpenParen => {
                if token == Token::OpenParen {
                    parens += 1;
                }
                at_start = true;
                skip_segment = false;
            }
            Token::CloseParen => {
                parens -= 1;
                if parens < 0 {
                    return Err(CommandParseError::UnbalancedParens);
                }
                at_start = false;
            }
            Token::Redirect { op, target } => {
                let Some(target) = target else { continue };
                merge_substitutions(&mut analysis, &target, depth)?;
                if !op.ends_with("<<") && !op.ends_with("<<-") && !op.ends_with("<<<") {
                    if op.contains('>') {
                        analysis.write_targets.push(target.text.clone());
                    }
                    analysis.operands.push(target.text);
                }
            }
            Token::Word(word) => {
                merge_substitutions(&mut analysis, &word, depth)?;
                if function_name {
                    // `function NAME [()]`: the body is a command list.
                    function_name = false;
                    i += definition_parens(&tokens, i);
                    continue;
                }
                if !at_start || skip_segment {
                    analysis.operands.push(word.text);
                    continue;
                }
                if ASSIGNMENT.is_match(&word.text) {
                    if let Some((_, value)) = word.text.split_once('=') {
                        analysis.operands.push(value.to_string());
                    }
                    continue;
                }
                if !word.quoted && KEYWORDS.contains(&word.text.as_str()) {
                    continue;
                }
                if !word.quoted && word.text == "function" {
                    function_name = true;
                    continue;
                }
                if !word.quoted && SEGMENT_KEYWORDS.contains(&word.text.as_str()) {
                    skip_segment = true;
                    continue;
                }
                let parens_len = definition_parens(&tokens, i);
                if parens_len > 0 {
                    // `NAME() BODY`: defines NAME; BODY's commands are what run.
                    i += parens_len;
                    continue;
                }
                analysis.programs.push(base_name(&word.text));
                at_start = false;
            }
        }
    }

    if parens != 0 {
        return Err(CommandParseError::UnbalancedParens);
    }
    Ok(analysis)
}

/// Length of an empty `()` pair at `tokens[i..]`, which marks a function
/// definition after its name.
fn definition_parens(tokens: &[Token], i: usize) -> usize {
    match (tokens.get(i), tokens.get(i + 1)) {
        (Some(Token::OpenParen), Some(Token::CloseParen)) => 2,
        _ => 0,
    }
}

fn merge_substitutions(
    analysis: &mut CommandAnalysis,
    word: &Word,
    depth: usize,
) -> Result<(), CommandParseError> {
    for inner in &word.substitutions {
        let nested = analyze_nested(inner, depth + 1)?;
        analysis.programs.extend(nested.programs);
        analysis.operands.extend(nested.operands);
        analysis.write_targets.extend(nested.write_targets);
    }
    Ok(())
}

/// Strip directory components: `/usr/bin/git` -> `git`.
fn base_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
        .to_string()
}

// ── Direct execution ────────────────────────────────────────────────────────

/// Split `raw` into an argument vector when it can run without a shell.
///
/// Returns `None` when the command uses any operator, redirection, expansion,
/// glob or assignment prefix; such commands need a shell.
pub fn direct_argv(raw: &str) -> Option<Vec<String>> {
    if raw.trim().is_empty() || has_shell_syntax(raw) {
        return None;
    }
    let tokens = Lexer::new(raw).tokens().ok()?;
    let mut argv = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::Word(w) if w.substitutions.is_empty() => argv.push(w.text),
            _ => return None,
        }
    }
    match argv.first() {
        Some(first) if !ASSIGNMENT.is_match(first) => Some(argv),
        _ => None,
    }
}

fn has_shell_syntax(raw: &str) -> bool {
    let mut chars = raw.chars();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '$' | '`' => return true,
                '\\' => {
                    chars.next();
                }
                _ => {}
            },
            None => match c {
                '\'' | '"' => quote = Some(c),
                '\\' => {
                    chars.next();
                }
                '|' | '&' | ';' | '<' | '>' | '(' | ')' | '$' | '`' | '*' | '?' | '[' | ']'
                | '{' | '}' | '~' | '!' | '#' | '\n' => return true,
                _ => {}
            },
        }
    }
    false
}
