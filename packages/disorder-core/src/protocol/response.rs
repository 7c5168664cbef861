//! The command/response line shape: a three-digit code plus message, with
//! the last digit distinguishing a single-line reply, a literal/string
//! result, or a dot-stuffed body introduction.

use crate::error::DisorderError;

use super::wire::{format_message, format_response};

/// A command's reply: one intro line, optionally followed by a
/// dot-stuffed body terminated by a lone `.`.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub text: String,
    pub body: Option<Vec<String>>,
}

impl Response {
    /// A single free-text line, e.g. `550 no such track`.
    pub fn message(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            body: None,
        }
    }

    /// `250 OK`, the generic success acknowledgment.
    pub fn ok() -> Self {
        Self::message(250, "OK")
    }

    /// A reply whose payload is a single quoted result, e.g. `252 "q1-7"`.
    pub fn result(code: u16, value: impl AsRef<str>) -> Self {
        Self {
            code,
            text: format_response(code, &[value.as_ref()])
                .splitn(2, ' ')
                .nth(1)
                .unwrap_or_default()
                .to_string(),
            body: None,
        }
    }

    /// A reply whose payload is several quoted tokens on one line, e.g.
    /// `259 "239.1.1.1" "5004"`.
    pub fn results(code: u16, values: &[&str]) -> Self {
        let rendered = format_response(code, values);
        let text = rendered.splitn(2, ' ').nth(1).unwrap_or_default().to_string();
        Self { code, text, body: None }
    }

    /// A reply introducing a dot-stuffed body (`queue`, `playlist-get`,
    /// `search`, ...).
    pub fn with_body(code: u16, intro: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            code,
            text: intro.into(),
            body: Some(lines),
        }
    }

    /// Renders every wire line this response produces, including the
    /// dot-stuffed body terminator if present.
    pub fn render_lines(&self) -> Vec<String> {
        let mut out = vec![format_message(self.code, &self.text)];
        if let Some(body) = &self.body {
            for line in body {
                out.push(super::wire::dot_stuff_line(line));
            }
            out.push(".".to_string());
        }
        out
    }
}

impl From<DisorderError> for Response {
    fn from(err: DisorderError) -> Self {
        Response::message(err.response_code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_renders_as_single_line() {
        assert_eq!(Response::ok().render_lines(), vec!["250 OK".to_string()]);
    }

    #[test]
    fn result_quotes_its_payload() {
        assert_eq!(Response::result(252, "q1-7").render_lines(), vec![r#"252 "q1-7""#.to_string()]);
    }

    #[test]
    fn body_response_terminates_with_lone_dot() {
        let r = Response::with_body(253, "OK", vec!["a".into(), ".b".into()]);
        assert_eq!(
            r.render_lines(),
            vec!["253 OK".to_string(), "a".to_string(), "..b".to_string(), ".".to_string()]
        );
    }

    #[test]
    fn error_maps_to_its_response_code() {
        let resp: Response = DisorderError::Rights("nope".into()).into();
        assert_eq!(resp.code, 510);
    }
}
