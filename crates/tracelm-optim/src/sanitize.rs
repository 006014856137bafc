//! Pre-processing of generator output before structured parsing.
//!
//! Two independent passes, both idempotent and both no-ops on clean input:
//!
//! - [`escape_inner_quotes`] finds quoted spans in JSON-like text and escapes
//!   quote characters that sit *inside* a value, so the parser does not take
//!   them for terminators. Raw control characters inside a span are escaped
//!   too, and stray backslashes are doubled.
//! - [`strip_unprintable`] drops characters that are illegal or invisible in
//!   the target format (control and zero-width characters; everything
//!   outside printable ASCII with [`Charset::Ascii`]).

use serde::{Deserialize, Serialize};

/// Which characters [`strip_unprintable`] keeps besides `\n`, `\r` and `\t`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Charset {
    /// Printable Unicode: drops control, zero-width and noncharacters.
    #[default]
    Unicode,
    /// Printable ASCII (`' '..='~'`) only.
    Ascii,
}

/// Options for [`sanitize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeOptions {
    pub charset: Charset,
    pub escape_quotes: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        SanitizeOptions {
            charset: Charset::Unicode,
            escape_quotes: true,
        }
    }
}

/// Runs [`strip_unprintable`] then, if enabled, [`escape_inner_quotes`].
pub fn sanitize(text: &str, options: &SanitizeOptions) -> String {
    let stripped = strip_unprintable(text, options.charset);
    if options.escape_quotes {
        escape_inner_quotes(&stripped)
    } else {
        stripped
    }
}

/// Removes characters outside the printable range of `charset`.
/// Line breaks and tabs are kept.
pub fn strip_unprintable(text: &str, charset: Charset) -> String {
    text.chars().filter(|&c| is_printable(c, charset)).collect()
}

fn is_printable(c: char, charset: Charset) -> bool {
    if matches!(c, '\n' | '\r' | '\t') {
        return true;
    }
    match charset {
        Charset::Ascii => (' '..='~').contains(&c),
        Charset::Unicode => {
            !c.is_control()
                && !matches!(c, '\u{200B}'..='\u{200F}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}')
                && !is_noncharacter(c)
        }
    }
}

fn is_noncharacter(c: char) -> bool {
    let code = c as u32;
    (0xFDD0..=0xFDEF).contains(&code) || (code & 0xFFFE) == 0xFFFE
}

/// Escapes quote characters inside quoted spans of JSON-like text.
///
/// A `"` inside a span closes it only when what follows could continue the
/// document: end of input, `}` or `]`, or a `,` / `:` followed by the start
/// of another key or value. Any other `"` is interior and becomes `\"`.
/// Existing escape sequences are kept verbatim.
pub fn escape_inner_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }

        match c {
            '\\' => {
                if is_valid_escape(&chars, i + 1) {
                    out.push('\\');
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                out.push_str("\\\\");
            }
            '"' => {
                if closes_span(&chars, i + 1) {
                    in_string = false;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
        i += 1;
    }
    out
}

fn is_valid_escape(chars: &[char], at: usize) -> bool {
    match chars.get(at) {
        Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => true,
        Some('u') => {
            chars.len() >= at + 5 && chars[at + 1..at + 5].iter().all(|c| c.is_ascii_hexdigit())
        }
        _ => false,
    }
}

fn next_non_space(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&k| !chars[k].is_whitespace())
}

fn closes_span(chars: &[char], after: usize) -> bool {
    let Some(k) = next_non_space(chars, after) else {
        return true;
    };
    match chars[k] {
        '}' | ']' => true,
        ',' | ':' => match next_non_space(chars, k + 1) {
            Some(v) => starts_value(chars, v),
            None => true,
        },
        _ => false,
    }
}

fn starts_value(chars: &[char], at: usize) -> bool {
    match chars[at] {
        '"' | '{' | '[' | '}' | ']' | '-' => true,
        c if c.is_ascii_digit() => true,
        _ => ["true", "false", "null"].iter().any(|word| {
            let end = at + word.len();
            end <= chars.len()
                && chars[at..end].iter().copied().eq(word.chars())
                && chars.get(end).map_or(true, |c| !c.is_alphanumeric())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_quotes_are_escaped() {
        let raw = r#"{"a": "he said "hi""}"#;
        let fixed = escape_inner_quotes(raw);
        assert_eq!(fixed, r#"{"a": "he said \"hi\""}"#);
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["a"], "he said \"hi\"");
    }

    #[test]
    fn escaped_text_is_left_alone() {
        let clean = r#"{"a": "he said \"hi\"", "b": [1, true, null]}"#;
        assert_eq!(escape_inner_quotes(clean), clean);
    }

    #[test]
    fn quote_before_prose_comma_is_interior() {
        let raw = r#"{"note": "she said "wait", then left", "n": 1}"#;
        let value: serde_json::Value = serde_json::from_str(&escape_inner_quotes(raw)).unwrap();
        assert_eq!(value["note"], r#"she said "wait", then left"#);
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn raw_newlines_and_stray_backslashes_are_escaped() {
        let raw = "{\"code\": \"line one\nC:\\path\"}";
        let fixed = escape_inner_quotes(raw);
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["code"], "line one\nC:\\path");
        assert_eq!(escape_inner_quotes(&fixed), fixed);
    }

    #[test]
    fn structure_outside_strings_is_untouched() {
        let raw = "{\n  \"a\": 1,\n  \"b\": \"x\"\n}";
        assert_eq!(escape_inner_quotes(raw), raw);
    }

    #[test]
    fn strip_unprintable_drops_controls_and_zero_width() {
        let raw = "a\u{0007}b\u{200B}c\u{FEFF}\nd\te";
        assert_eq!(strip_unprintable(raw, Charset::Unicode), "abc\nd\te");
        assert_eq!(strip_unprintable("héllo ✓", Charset::Unicode), "héllo ✓");
        assert_eq!(strip_unprintable("héllo ✓", Charset::Ascii), "hllo ");
    }

    #[test]
    fn sanitize_composes_both_passes() {
        let raw = "{\"a\": \"say \"yes\"\u{0000}\"}";
        let fixed = sanitize(raw, &SanitizeOptions::default());
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["a"], "say \"yes\"");

        let no_quotes = SanitizeOptions {
            escape_quotes: false,
            ..SanitizeOptions::default()
        };
        assert_eq!(sanitize("a\u{0000}\"b\"", &no_quotes), "a\"b\"");
    }

    mod idempotence {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn strip_is_idempotent(text in any::<String>()) {
                for charset in [Charset::Unicode, Charset::Ascii] {
                    let once = strip_unprintable(&text, charset);
                    prop_assert_eq!(strip_unprintable(&once, charset), once.clone());
                }
            }

            #[test]
            fn escape_is_idempotent_on_json_like_text(text in r#"[a-z "{}:,\[\]\\\n]{0,40}"#) {
                let once = escape_inner_quotes(&text);
                prop_assert_eq!(escape_inner_quotes(&once), once.clone());
            }

            #[test]
            fn escape_is_a_noop_on_serialized_json(s in any::<String>()) {
                let json = serde_json::to_string(&serde_json::json!({ "k": s, "n": [1, 2] })).unwrap();
                prop_assert_eq!(escape_inner_quotes(&json), json.clone());
            }
        }
    }
}
