//! Extraction of proposed parameter values from a model reply.
//!
//! The reply is free text from an uncontrolled generator, so parsing is
//! lenient: lines of the shape `name = value` are collected, everything else
//! is skipped, and a name defined twice keeps its last value. Nothing here
//! fails; a reply with no usable line yields an empty [`ParsedUpdate`].
//!
//! Accepted variations:
//!
//! - list bullets (`- `, `* `, `1. `) before the name;
//! - names wrapped in backticks or quotes, and display names like `x:0`
//!   (normalized to `x0`);
//! - values opening a triple quote, a code fence or an unbalanced bracket
//!   continue on the following lines until closed (or the reply ends);
//! - one pair of surrounding quotes is stripped from single-line values.
//!
//! `name == value` is a comparison and is skipped. A value is taken verbatim
//! after the first `=`, so `a = b = c` proposes `b = c` for `a`.

use indexmap::IndexMap;
use serde::Serialize;

use tracelm_core::value_text;

use crate::sanitize::{escape_inner_quotes, strip_unprintable, SanitizeOptions};

/// Parameter identifier → proposed value text, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ParsedUpdate {
    entries: IndexMap<String, String>,
}

impl ParsedUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Records a proposal; a later proposal for the same name wins.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Splits the update into the entries whose names are in `names` and
    /// the names that are not.
    pub fn restrict_to<'a, I>(self, names: I) -> (ParsedUpdate, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let allowed: Vec<&str> = names.into_iter().collect();
        let mut kept = ParsedUpdate::new();
        let mut ignored = Vec::new();
        for (name, value) in self.entries {
            if allowed.contains(&name.as_str()) {
                kept.entries.insert(name, value);
            } else {
                ignored.push(name);
            }
        }
        (kept, ignored)
    }

    pub fn into_inner(self) -> IndexMap<String, String> {
        self.entries
    }
}

impl<K, V> FromIterator<(K, V)> for ParsedUpdate
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut update = ParsedUpdate::new();
        for (name, value) in iter {
            update.insert(name, value);
        }
        update
    }
}

/// Parses a full reply.
///
/// Unprintable characters are stripped first. A JSON object carrying a
/// `"suggestion"` map (optionally inside a ```` ```json ```` fence) is
/// accepted after quote escaping; otherwise the reply is read as
/// `name = value` lines.
pub fn parse_response(text: &str, options: &SanitizeOptions) -> ParsedUpdate {
    let cleaned = strip_unprintable(text, options.charset);
    if let Some(update) = parse_suggestion_json(&cleaned, options.escape_quotes) {
        if !update.is_empty() {
            return update;
        }
    }
    parse_equations(&cleaned)
}

/// Parses `name = value` lines. Never fails.
pub fn parse_equations(text: &str) -> ParsedUpdate {
    let lines: Vec<&str> = text.lines().collect();
    let mut update = ParsedUpdate::new();
    let mut i = 0;
    while i < lines.len() {
        let Some((name, rest)) = split_assignment(lines[i]) else {
            i += 1;
            continue;
        };
        let (value, consumed) = read_value(rest, &lines[i + 1..]);
        if !value.trim().is_empty() {
            update.insert(name, value);
        }
        i += 1 + consumed;
    }
    update
}

fn parse_suggestion_json(text: &str, escape_quotes: bool) -> Option<ParsedUpdate> {
    let candidate = json_candidate(text)?;
    let candidate = if escape_quotes {
        escape_inner_quotes(candidate)
    } else {
        candidate.to_string()
    };
    let value: serde_json::Value = serde_json::from_str(&candidate).ok()?;
    let suggestion = value.get("suggestion")?.as_object()?;
    Some(
        suggestion
            .iter()
            .filter_map(|(name, value)| normalize_name(name).map(|name| (name, value_text(value))))
            .collect(),
    )
}

/// The ```` ```json ```` block if there is one, else the outermost `{...}`.
fn json_candidate(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn strip_bullet(line: &str) -> &str {
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let after = &line[digits..];
        if let Some(rest) = after.strip_prefix(". ").or_else(|| after.strip_prefix(") ")) {
            return rest.trim_start();
        }
    }
    line
}

/// `ident` or `ident:digits` → identifier without the colon.
fn normalize_name(raw: &str) -> Option<String> {
    let (base, suffix) = match raw.split_once(':') {
        Some((base, suffix)) => {
            if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            (base, suffix)
        }
        None => (raw, ""),
    };
    let mut chars = base.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(format!("{}{}", base, suffix))
}

fn split_assignment(line: &str) -> Option<(String, &str)> {
    let mut rest = strip_bullet(line.trim_start());
    let opener = rest.chars().next()?;
    let wrapped = matches!(opener, '`' | '"' | '\'');
    if wrapped {
        rest = &rest[opener.len_utf8()..];
    }

    let name_len = rest
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_' || *c == ':'))
        .map_or(rest.len(), |(i, _)| i);
    let name = normalize_name(&rest[..name_len])?;
    rest = &rest[name_len..];
    if wrapped {
        rest = rest.strip_prefix(opener)?;
    }

    let rest = rest.trim_start_matches([' ', '\t']).strip_prefix('=')?;
    if rest.starts_with('=') {
        return None;
    }
    Some((name, rest.trim_start_matches([' ', '\t'])))
}

/// Reads the value starting at `first`, pulling continuation lines from
/// `following` for multi-line forms. Returns the value and how many
/// following lines it consumed.
fn read_value(first: &str, following: &[&str]) -> (String, usize) {
    let head = first.trim();

    for delim in ["\"\"\"", "'''"] {
        if let Some(after) = head.strip_prefix(delim) {
            if let Some(end) = after.find(delim) {
                return (after[..end].to_string(), 0);
            }
            let mut parts = vec![after];
            for (k, line) in following.iter().enumerate() {
                if let Some(end) = line.find(delim) {
                    parts.push(&line[..end]);
                    return (join_block(&parts), k + 1);
                }
                parts.push(line);
            }
            return (join_block(&parts), following.len());
        }
    }

    if let Some(after) = head.strip_prefix("```") {
        if let Some(end) = after.find("```") {
            return (after[..end].trim().to_string(), 0);
        }
        let is_tag = after
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_'));
        let mut parts: Vec<&str> = if is_tag { Vec::new() } else { vec![after] };
        for (k, line) in following.iter().enumerate() {
            if line.trim_start().starts_with("```") {
                return (parts.join("\n"), k + 1);
            }
            parts.push(line);
        }
        return (parts.join("\n"), following.len());
    }

    if head.starts_with(['{', '[', '(']) {
        let mut depth = BracketDepth::default();
        depth.feed(head);
        if depth.is_open() {
            let mut parts = vec![head];
            for (k, line) in following.iter().enumerate() {
                parts.push(line);
                depth.feed(line);
                if !depth.is_open() {
                    return (parts.join("\n").trim_end().to_string(), k + 1);
                }
            }
            return (parts.join("\n").trim_end().to_string(), following.len());
        }
        return (head.to_string(), 0);
    }

    (unquote(head), 0)
}

/// Joins the lines of a triple-quoted block, dropping the empty remainder of
/// the opening line.
fn join_block(parts: &[&str]) -> String {
    let parts = match parts.split_first() {
        Some((first, rest)) if first.trim().is_empty() => rest,
        _ => parts,
    };
    parts.join("\n")
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 {
        if value.starts_with('"') && value.ends_with('"') {
            if let Ok(text) = serde_json::from_str::<String>(value) {
                return text;
            }
            return value[1..value.len() - 1].to_string();
        }
        for quote in ['\'', '`'] {
            if value.starts_with(quote) && value.ends_with(quote) {
                return value[1..value.len() - 1].to_string();
            }
        }
    }
    value.to_string()
}

/// Bracket nesting across lines, ignoring brackets inside string literals.
#[derive(Default)]
struct BracketDepth {
    depth: i32,
    quote: Option<char>,
    escaped: bool,
}

impl BracketDepth {
    fn feed(&mut self, line: &str) {
        for c in line.chars() {
            if let Some(q) = self.quote {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == q {
                    self.quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => self.quote = Some(c),
                '{' | '[' | '(' => self.depth += 1,
                '}' | ']' | ')' => self.depth -= 1,
                _ => {}
            }
        }
        self.escaped = false;
    }

    fn is_open(&self) -> bool {
        self.depth > 0
    }
}
