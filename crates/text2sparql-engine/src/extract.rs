//! Pull a single SPARQL query out of free-form model output.
//!
//! Order of attempts:
//!
//! 1. fenced code blocks (```` ```sparql ````, bare ```` ``` ````, or any info
//!    string), first well-formed one wins;
//! 2. a scan from the first line that starts with a SPARQL keyword, running
//!    to the close of the outermost group and any trailing solution
//!    modifiers (`ORDER BY`, `LIMIT`, ...).
//!
//! The contents of a fenced block go through the same scan, so prose inside
//! the fence is dropped. `#` comments directly above or after the query are
//! kept either way.
//!
//! Brace matching ignores string literals, IRIs and comments. The result is
//! trimmed, and extracting from an extracted query returns it unchanged.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("model output is empty")]
    Empty,
    #[error("no SPARQL query found in model output")]
    NoQuery,
    #[error("unbalanced braces in candidate SPARQL query")]
    Unbalanced,
}

const START_KEYWORDS: &[&str] = &["PREFIX", "BASE", "SELECT", "ASK", "CONSTRUCT", "DESCRIBE"];

fn query_form_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(SELECT|ASK|CONSTRUCT|DESCRIBE)\b").unwrap_or_else(|e| {
            unreachable!("static regex failed to compile: {e}")
        })
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\s+").unwrap_or_else(|e| unreachable!("static regex failed to compile: {e}"))
    })
}

/// Extract one SPARQL query from raw model output.
pub fn extract(raw: &str) -> Result<String, ExtractionError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ExtractionError::Empty);
    }

    for block in fenced_blocks(text) {
        let candidate = block.trim();
        if looks_like_sparql(candidate) {
            return Ok(scan_unfenced(candidate).unwrap_or_else(|_| candidate.to_string()));
        }
    }

    scan_unfenced(text)
}

/// A query form keyword plus balanced braces (or a brace-less `DESCRIBE`).
pub fn looks_like_sparql(candidate: &str) -> bool {
    let Some(form) = query_form_re().find(candidate) else {
        return false;
    };
    let mut depth = 0usize;
    let mut groups = 0usize;
    let mut lexer = Lexer::new(candidate, 0);
    while let Some((_, tok)) = lexer.next_token() {
        match tok {
            Tok::Open => depth += 1,
            Tok::Close => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                groups += 1;
            }
            _ => {}
        }
    }
    depth == 0 && (groups > 0 || form.as_str().eq_ignore_ascii_case("DESCRIBE"))
}

/// Collapse runs of whitespace, for one-line display.
pub fn compact(query: &str) -> String {
    whitespace_re().replace_all(query.trim(), " ").into_owned()
}

// ============================================================================
// Fenced blocks
// ============================================================================

fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match current.as_mut() {
            None => {
                if let Some(rest) = trimmed.strip_prefix("```") {
                    // Single-line block: ```sparql ASK { ... } ```
                    if let Some(inner) = rest.strip_suffix("```") {
                        let inner = strip_info_string(inner);
                        blocks.push(inner.to_string());
                    } else {
                        current = Some(Vec::new());
                    }
                }
            }
            Some(lines) => {
                if trimmed == "```" {
                    blocks.push(lines.join("\n"));
                    current = None;
                } else if let Some(body) = trimmed.strip_suffix("```") {
                    lines.push(body);
                    blocks.push(lines.join("\n"));
                    current = None;
                } else {
                    lines.push(line);
                }
            }
        }
    }
    // Truncated answers often lose the closing fence.
    if let Some(lines) = current {
        blocks.push(lines.join("\n"));
    }
    blocks
}

fn strip_info_string(inner: &str) -> &str {
    let inner = inner.trim_start();
    match inner.split_once(char::is_whitespace) {
        Some((info, rest)) if info.eq_ignore_ascii_case("sparql") => rest,
        _ => inner,
    }
}

// ============================================================================
// Unfenced scan
// ============================================================================

fn scan_unfenced(text: &str) -> Result<String, ExtractionError> {
    let mut saw_unbalanced = false;
    let mut offset = 0;
    // Start of the run of `#` lines (blank lines allowed) right above the
    // current line.
    let mut comments_from: Option<usize> = None;

    for line in text.split_inclusive('\n') {
        let indent = line.len() - line.trim_start().len();
        let line_start = offset + indent;
        offset += line.len();

        let body = line.trim();
        if body.starts_with('#') {
            comments_from.get_or_insert(line_start);
            continue;
        }
        if !starts_with_keyword(&text[line_start..]) {
            if !body.is_empty() {
                comments_from = None;
            }
            continue;
        }
        let lead = &text[comments_from.take().unwrap_or(line_start)..line_start];
        let candidate = &text[line_start..];
        match scan_query_end(candidate) {
            Ok(end) => {
                let query = candidate[..end].trim();
                if query_form_re().is_match(query) {
                    return Ok(format!("{lead}{query}").trim().to_string());
                }
            }
            Err(ExtractionError::Unbalanced) => saw_unbalanced = true,
            Err(_) => {
                if let Some(query) = describe_without_group(candidate) {
                    return Ok(format!("{lead}{query}").trim().to_string());
                }
            }
        }
    }

    if saw_unbalanced {
        Err(ExtractionError::Unbalanced)
    } else {
        Err(ExtractionError::NoQuery)
    }
}

/// Uppercase or all-lowercase keywords only, so prose like "Select the..." is
/// not mistaken for a query.
fn starts_with_keyword(s: &str) -> bool {
    let word = leading_word(s);
    keyword_cased(word) && START_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn keyword_cased(word: &str) -> bool {
    word == word.to_ascii_uppercase() || word == word.to_ascii_lowercase()
}

fn leading_word(s: &str) -> &str {
    let end = s.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(s.len());
    &s[..end]
}

/// `DESCRIBE <iri>` needs no group: take its line.
fn describe_without_group(candidate: &str) -> Option<String> {
    let m = query_form_re().find(candidate)?;
    if !m.as_str().eq_ignore_ascii_case("DESCRIBE") {
        return None;
    }
    let line_end = candidate[m.start()..]
        .find('\n')
        .map(|i| m.start() + i)
        .unwrap_or(candidate.len());
    let query = candidate[..line_end].trim();
    (query.len() > m.end() - m.start()).then(|| query.to_string())
}

/// Byte offset just past the query that starts at the top of `s`.
fn scan_query_end(s: &str) -> Result<usize, ExtractionError> {
    let mut lexer = Lexer::new(s, 0);
    let mut depth = 0usize;

    while let Some((pos, tok)) = lexer.next_token() {
        match tok {
            Tok::Open => depth += 1,
            Tok::Close => {
                if depth == 0 {
                    return Err(ExtractionError::Unbalanced);
                }
                depth -= 1;
                if depth == 0 {
                    let close = pos + 1;
                    if continues_with_group(&s[close..]) {
                        continue;
                    }
                    return Ok(consume_modifiers(s, close));
                }
            }
            _ => {}
        }
    }

    if depth > 0 {
        Err(ExtractionError::Unbalanced)
    } else {
        Err(ExtractionError::NoQuery)
    }
}

/// `CONSTRUCT { ... } WHERE { ... }` and friends.
fn continues_with_group(rest: &str) -> bool {
    let rest = rest.trim_start();
    rest.starts_with('{') || leading_word(rest).eq_ignore_ascii_case("WHERE")
}

/// A solution modifier keyword followed by the syntax it takes, so a prose
/// line like "Order of results does not matter." is left alone.
fn starts_with_modifier(s: &str) -> bool {
    let word = leading_word(s);
    if word.is_empty() || !keyword_cased(word) {
        return false;
    }
    let after = s[word.len()..].trim_start();
    match word.to_ascii_uppercase().as_str() {
        "ORDER" | "GROUP" => leading_word(after).eq_ignore_ascii_case("BY"),
        "LIMIT" | "OFFSET" => after.starts_with(|c: char| c.is_ascii_digit()),
        // `HAVING (...)` or `HAVING COUNT(...) > 1`
        "HAVING" => {
            let call = leading_word(after);
            after.starts_with('(') || (!call.is_empty() && after[call.len()..].starts_with('('))
        }
        "VALUES" => after.starts_with(|c: char| matches!(c, '?' | '$' | '(' | '{')),
        _ => false,
    }
}

fn consume_modifiers(s: &str, from: usize) -> usize {
    let mut end = from;
    loop {
        let rest = &s[end..];
        let start = end + (rest.len() - rest.trim_start().len());
        let line = &s[start..];
        if line.starts_with('#') {
            let len = line.find('\n').unwrap_or(line.len());
            end = start + line[..len].trim_end().len();
            continue;
        }
        if !starts_with_modifier(line) {
            return end;
        }

        // The modifier runs to the end of its line; VALUES blocks may span
        // several lines.
        let mut lexer = Lexer::new(s, start);
        let mut depth = 0usize;
        let mut line_end = s.len();
        while let Some((pos, tok)) = lexer.next_token() {
            match tok {
                Tok::Open => depth += 1,
                Tok::Close => depth = depth.saturating_sub(1),
                Tok::Newline if depth == 0 => {
                    line_end = pos;
                    break;
                }
                _ => {}
            }
        }
        end = start + s[start..line_end].trim_end().len();
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Open,
    Close,
    Newline,
    Other,
}

/// Byte-level tokenizer. Delimiters are ASCII, so every position it yields
/// is a char boundary.
struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(s: &'a str, pos: usize) -> Self {
        Self {
            bytes: s.as_bytes(),
            pos,
        }
    }

    fn next_token(&mut self) -> Option<(usize, Tok)> {
        loop {
            let i = self.pos;
            let c = *self.bytes.get(i)?;
            let tok = match c {
                b'{' => Tok::Open,
                b'}' => Tok::Close,
                b'\n' => Tok::Newline,
                b'#' => {
                    self.pos = self.line_end(i);
                    continue;
                }
                b'"' => {
                    self.pos = self.string_end(i);
                    return Some((i, Tok::Other));
                }
                // `dbr:Ender's_Game` is a (sloppy) name, not a string opener.
                b'\'' if i == 0 || !self.bytes[i - 1].is_ascii_alphanumeric() => {
                    self.pos = self.string_end(i);
                    return Some((i, Tok::Other));
                }
                b'<' => {
                    self.pos = self.iri_end(i).unwrap_or(i + 1);
                    return Some((i, Tok::Other));
                }
                b'\\' => {
                    self.pos = (i + 2).min(self.bytes.len());
                    return Some((i, Tok::Other));
                }
                _ => Tok::Other,
            };
            self.pos = i + 1;
            return Some((i, tok));
        }
    }

    fn line_end(&self, from: usize) -> usize {
        self.bytes[from..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| from + p)
            .unwrap_or(self.bytes.len())
    }

    /// Position after the closing quote; unterminated strings stop at the
    /// end of the line.
    fn string_end(&self, open: usize) -> usize {
        let quote = self.bytes[open];
        let mut i = open + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' => i += 2,
                b'\n' => return i,
                b if b == quote => return i + 1,
                _ => i += 1,
            }
        }
        self.bytes.len()
    }

    /// `<...>` without whitespace inside is an IRI; `?x < 5` is not.
    fn iri_end(&self, open: usize) -> Option<usize> {
        for (offset, &b) in self.bytes[open + 1..].iter().enumerate() {
            match b {
                b'>' => return Some(open + 1 + offset + 1),
                b if b.is_ascii_whitespace() || b == b'{' || b == b'}' || b == b'<' => {
                    return None
                }
                _ => {}
            }
        }
        None
    }
}
