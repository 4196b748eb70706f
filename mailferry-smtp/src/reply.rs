//! SMTP reply parsing and wire formatting.
//!
//! A reply is a three digit code plus one or more text lines. On the wire,
//! every line but the last joins code and text with `-`; the last line uses
//! a space and optionally carries an RFC 3463 enhanced status code.

use thiserror::Error;

/// Errors produced while parsing reply lines off the wire.
#[derive(Debug, Error)]
pub enum ReplyParseError {
    #[error("malformed reply line: '{0}'")]
    Malformed(String),

    #[error("reply code {0} outside 100-599")]
    CodeOutOfRange(u16),

    #[error("status code mismatch in multi-line reply: expected {expected}, got {got}")]
    CodeMismatch { expected: u16, got: u16 },

    #[error("invalid UTF-8 in reply: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// The enhanced status code attached to a reply's final line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Enhanced {
    /// The producer supplied nothing; a default of `(class, 0, 0)` is
    /// synthesised when the code is 2xx, 4xx, or in 500-559.
    #[default]
    NotSet,
    /// Never emit an enhanced code on this reply. Used wherever the reply
    /// text already carries an upstream enhanced code verbatim.
    Suppressed,
    Code(u16, u16, u16),
}

/// A complete SMTP reply, possibly multi-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub enhanced: Enhanced,
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a single-line reply with no enhanced code attached yet.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: Enhanced::NotSet,
            lines: vec![text.into()],
        }
    }

    /// Attaches an explicit enhanced status code.
    #[must_use]
    pub fn with_enhanced(mut self, enhanced: (u16, u16, u16)) -> Self {
        self.enhanced = Enhanced::Code(enhanced.0, enhanced.1, enhanced.2);
        self
    }

    /// Builds a reply from an upstream message whose lines are joined by
    /// `\n`. The enhanced code is suppressed: whatever the upstream put at
    /// the front of its text must reach the downstream client untouched.
    pub fn from_upstream(code: u16, message: &str) -> Self {
        Self {
            code,
            enhanced: Enhanced::Suppressed,
            lines: message.split('\n').map(str::to_string).collect(),
        }
    }

    /// The reply text with lines joined by `\n`, mirroring the parse side.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn class(&self) -> u16 {
        self.code / 100
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// A permanent failure for the purposes of the passthrough loop.
    /// 560-599 are treated as synthetic/non-terminal, matching the engine's
    /// own 599 transport marker.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code <= 559
    }

    /// The enhanced code that will actually be emitted, after applying the
    /// synthesis rule for `NotSet`.
    #[must_use]
    pub const fn effective_enhanced(&self) -> Option<(u16, u16, u16)> {
        match self.enhanced {
            Enhanced::Code(class, subject, detail) => Some((class, subject, detail)),
            Enhanced::Suppressed => None,
            Enhanced::NotSet => match self.code {
                200..=299 | 400..=499 | 500..=559 => Some((self.code / 100, 0, 0)),
                _ => None,
            },
        }
    }

    /// Renders the reply as wire lines, without terminators.
    #[must_use]
    pub fn wire_lines(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.lines.len().max(1));
        let (last, rest) = match self.lines.split_last() {
            Some((last, rest)) => (last.as_str(), rest),
            None => ("", &[][..]),
        };

        for line in rest {
            out.push(format!("{}-{line}", self.code));
        }
        match self.effective_enhanced() {
            Some((class, subject, detail)) => {
                out.push(format!("{} {class}.{subject}.{detail} {last}", self.code));
            }
            None => out.push(format!("{} {last}", self.code)),
        }
        out
    }

    /// Parses one reply line into `(code, is_last, text)`.
    pub fn parse_line(line: &str) -> Result<(u16, bool, String), ReplyParseError> {
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(ReplyParseError::Malformed(line.to_string()));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ReplyParseError::Malformed(line.to_string()))?;
        if !(100..=599).contains(&code) {
            return Err(ReplyParseError::CodeOutOfRange(code));
        }

        let is_last = match line.as_bytes().get(3) {
            Some(b' ') => true,
            Some(b'-') => false,
            // A bare three digit line is a valid terminal reply.
            None => true,
            Some(_) => return Err(ReplyParseError::Malformed(line.to_string())),
        };

        let text = if line.len() > 4 {
            line[4..].to_string()
        } else {
            String::new()
        };

        Ok((code, is_last, text))
    }

    /// Parses a complete reply out of `buffer`, returning it together with
    /// the number of bytes consumed, or `None` when more input is needed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>, ReplyParseError> {
        let text = std::str::from_utf8(buffer)?;
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut first_code = None;

        loop {
            let rest = &text[consumed..];
            let Some(newline) = rest.find('\n') else {
                return Ok(None); // incomplete line
            };
            let raw = &rest[..newline];
            consumed += newline + 1;
            let line = raw.strip_suffix('\r').unwrap_or(raw);

            if line.is_empty() {
                continue; // stray blank line between replies
            }

            let (code, is_last, message) = Self::parse_line(line)?;
            match first_code {
                Some(expected) if expected != code => {
                    return Err(ReplyParseError::CodeMismatch {
                        expected,
                        got: code,
                    });
                }
                Some(_) => {}
                None => first_code = Some(code),
            }
            lines.push(message);

            if is_last {
                return Ok(Some((
                    Self {
                        code,
                        enhanced: Enhanced::Suppressed,
                        lines,
                    },
                    consumed,
                )));
            }
        }
    }

    /// Checks a reply code against an expectation in textproto style: a one
    /// digit expectation matches the class, two digits match the first two
    /// digits, three match exactly. Zero matches anything.
    #[must_use]
    pub const fn matches_expectation(code: u16, expect: u16) -> bool {
        match expect {
            0 => true,
            1..=9 => code / 100 == expect,
            10..=99 => code / 10 == expect,
            _ => code == expect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line() {
        let (reply, consumed) = Reply::parse_response(b"220 mail.example.com ESMTP\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["mail.example.com ESMTP"]);
        assert_eq!(consumed, 28);
    }

    #[test]
    fn parse_multi_line() {
        let data = b"250-mail.example.com\r\n250-PIPELINING\r\n250 HELP\r\n";
        let (reply, consumed) = Reply::parse_response(data).unwrap().unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec!["mail.example.com", "PIPELINING", "HELP"]);
        assert_eq!(consumed, data.len());
        assert_eq!(reply.message(), "mail.example.com\nPIPELINING\nHELP");
    }

    #[test]
    fn parse_incomplete_returns_none() {
        assert!(
            Reply::parse_response(b"250-mail.example.com\r\n250-SIZ")
                .unwrap()
                .is_none()
        );
        assert!(Reply::parse_response(b"25").unwrap().is_none());
    }

    #[test]
    fn parse_bare_code() {
        let (reply, _) = Reply::parse_response(b"354\r\n").unwrap().unwrap();
        assert_eq!(reply.code, 354);
        assert_eq!(reply.lines, vec![""]);
    }

    #[test]
    fn parse_rejects_mixed_codes() {
        let err = Reply::parse_response(b"250-one\r\n550 two\r\n").unwrap_err();
        assert!(matches!(
            err,
            ReplyParseError::CodeMismatch {
                expected: 250,
                got: 550
            }
        ));
    }

    #[test]
    fn parse_rejects_bad_separator() {
        assert!(Reply::parse_response(b"250_nope\r\n").is_err());
        assert!(Reply::parse_response(b"999 nope\r\n").is_err());
    }

    #[test]
    fn enhanced_synthesis_ranges() {
        assert_eq!(
            Reply::new(250, "Ok").effective_enhanced(),
            Some((2, 0, 0))
        );
        assert_eq!(
            Reply::new(421, "busy").effective_enhanced(),
            Some((4, 0, 0))
        );
        assert_eq!(
            Reply::new(559, "no").effective_enhanced(),
            Some((5, 0, 0))
        );
        // 599 is the synthetic transport marker: no enhanced code.
        assert_eq!(Reply::new(599, "broken pipe").effective_enhanced(), None);
        assert_eq!(Reply::new(354, "go ahead").effective_enhanced(), None);
        assert_eq!(Reply::new(220, "ready").effective_enhanced(), Some((2, 0, 0)));
    }

    #[test]
    fn wire_lines_terminal_forms() {
        let reply = Reply::new(500, "Speak up").with_enhanced((5, 5, 2));
        assert_eq!(reply.wire_lines(), vec!["500 5.5.2 Speak up"]);

        let reply = Reply::from_upstream(250, "2.0.0 mock");
        assert_eq!(reply.wire_lines(), vec!["250 2.0.0 mock"]);

        let reply = Reply {
            code: 250,
            enhanced: Enhanced::Suppressed,
            lines: vec!["Hello there".into(), "PIPELINING".into(), "8BITMIME".into()],
        };
        assert_eq!(
            reply.wire_lines(),
            vec!["250-Hello there", "250-PIPELINING", "250 8BITMIME"]
        );
    }

    #[test]
    fn upstream_multi_line_round_trip() {
        let data = b"250-first\r\n250 second\r\n";
        let (parsed, _) = Reply::parse_response(data).unwrap().unwrap();
        let again = Reply::from_upstream(parsed.code, &parsed.message());
        assert_eq!(again.wire_lines(), vec!["250-first", "250 second"]);
    }

    #[test]
    fn expectation_matching() {
        assert!(Reply::matches_expectation(254, 0));
        assert!(Reply::matches_expectation(254, 2));
        assert!(Reply::matches_expectation(251, 25));
        assert!(Reply::matches_expectation(250, 250));
        assert!(!Reply::matches_expectation(354, 2));
        assert!(!Reply::matches_expectation(251, 250));
    }
}
