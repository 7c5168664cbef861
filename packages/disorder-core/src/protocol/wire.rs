//! Line tokenizer, response formatting, and dot-stuffed body codec.
//!
//! The wire format is line-oriented UTF-8 terminated by LF (CRLF
//! tolerated). Lines are normalised to Unicode NFC before parsing. Tokens
//! are split on whitespace, with double-quoted strings supporting `\\`
//! and `\"` escapes; unbalanced quotes are a parse error. Response lines
//! are `<three digit code> <message>`; a `3`-suffixed code introduces a
//! dot-stuffed body.

use unicode_normalization::UnicodeNormalization;

/// Strips a trailing CRLF or LF from a raw line and normalizes it to
/// Unicode NFC. Body lines are *not* passed through this function — only
/// command lines are; body bytes (including embedded spaces) are
/// preserved verbatim, with no line-ending normalization applied.
pub fn normalize_command_line(raw: &str) -> String {
    let trimmed = raw.strip_suffix('\n').unwrap_or(raw);
    let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
    trimmed.nfc().collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("unterminated quoted string")]
    UnterminatedQuote,
    #[error("dangling escape character")]
    DanglingEscape,
}

/// Splits a normalized command line into whitespace-separated tokens,
/// honoring double-quoted strings with `\\`/`\"` escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut token = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => return Err(TokenizeError::DanglingEscape),
                    },
                    Some(c) => token.push(c),
                    None => return Err(TokenizeError::UnterminatedQuote),
                }
            }
            // A quoted token may be glued to trailing unquoted text
            // (`"foo"bar`); fold it into the same token.
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                token.push(chars.next().unwrap());
            }
        } else {
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                token.push(chars.next().unwrap());
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

/// Quotes `token` for inclusion in a line the server sends (event-log
/// arguments, `queue`/`recent` entry fields): wraps in double quotes,
/// escaping embedded `\` and `"`.
pub fn quote_token(token: &str) -> String {
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for ch in token.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Renders a response line's leading three-digit code plus a
/// space-joined, quoted argument list, e.g. `252 "q1-7"`.
pub fn format_response(code: u16, args: &[&str]) -> String {
    if args.is_empty() {
        format!("{code}")
    } else {
        let rendered: Vec<String> = args.iter().map(|a| quote_token(a)).collect();
        format!("{code} {}", rendered.join(" "))
    }
}

/// Renders a response line whose message is a single free-text string,
/// not individually quoted (e.g. `550 no such track`).
pub fn format_message(code: u16, message: &str) -> String {
    format!("{code} {message}")
}

/// Dot-stuffs one body line for transmission within a `xxx3`-style
/// response: a line consisting of a single `.` is escaped to `..` so the
/// body terminator (a lone `.`) is unambiguous. Bytes are otherwise
/// preserved verbatim, with no line-ending normalization applied.
pub fn dot_stuff_line(line: &str) -> String {
    if line.starts_with('.') {
        format!(".{line}")
    } else {
        line.to_string()
    }
}

/// Reverses [`dot_stuff_line`] when reading a body line back off the
/// wire (a line beginning with `.` has its first `.` stripped, unless it
/// is exactly `.`, the terminator, which callers must detect before
/// calling this).
pub fn dot_unstuff_line(line: &str) -> String {
    line.strip_prefix('.').map(str::to_string).unwrap_or_else(|| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_plain_whitespace_separated_words() {
        assert_eq!(tokenize("play /music/a.ogg").unwrap(), vec!["play", "/music/a.ogg"]);
    }

    #[test]
    fn tokenizes_quoted_string_with_spaces() {
        assert_eq!(
            tokenize(r#"set "my track" weight "10""#).unwrap(),
            vec!["set", "my track", "weight", "10"]
        );
    }

    #[test]
    fn tokenizes_escaped_quote_and_backslash() {
        assert_eq!(
            tokenize(r#""she said \"hi\" and \\left""#).unwrap(),
            vec![r#"she said "hi" and \left"#]
        );
    }

    #[test]
    fn unterminated_quote_is_a_parse_error() {
        assert_eq!(tokenize(r#"set "oops"#), Err(TokenizeError::UnterminatedQuote));
    }

    #[test]
    fn dangling_escape_is_a_parse_error() {
        assert_eq!(tokenize(r#""oops\"#), Err(TokenizeError::DanglingEscape));
    }

    #[test]
    fn crlf_is_tolerated() {
        assert_eq!(normalize_command_line("play a.ogg\r\n"), "play a.ogg");
    }

    #[test]
    fn nfc_normalization_is_applied() {
        // "e" + combining acute (NFD) normalizes to the precomposed form.
        let nfd = "e\u{0301}";
        let normalized = normalize_command_line(nfd);
        assert_eq!(normalized, "\u{00e9}");
    }

    #[test]
    fn dot_stuffing_round_trips_a_lone_dot_producing_line() {
        let stuffed = dot_stuff_line(".foo");
        assert_eq!(stuffed, "..foo");
        assert_eq!(dot_unstuff_line(&stuffed), ".foo");
    }

    #[test]
    fn format_response_quotes_each_argument() {
        assert_eq!(format_response(252, &["q1-7"]), r#"252 "q1-7""#);
        assert_eq!(format_response(250, &[]), "250");
    }
}
