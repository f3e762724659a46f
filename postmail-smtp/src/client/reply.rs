//! SMTP reply parsing.
//!
//! Bytes read from the socket are pushed into a [`ReplyBuffer`]. Complete
//! lines are matched against `DDD[ -]text`; continuation lines (`DDD-`) are
//! absorbed, and only the final line (`DDD ` or a bare code) yields a
//! [`Reply`]. An unterminated trailing line stays buffered until more input
//! arrives.

use super::error::{ClientError, Result};

/// Upper bound on buffered, not-yet-complete reply data.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// A single line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    /// `false` for continuation lines (`250-...`).
    pub is_last: bool,
    pub text: String,
}

impl ReplyLine {
    /// Parse one line, without its terminator.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Parse` if the line doesn't start with a
    /// three-digit code followed by a space, a dash, or nothing.
    pub fn parse(line: &str) -> Result<Self> {
        let bytes = line.as_bytes();
        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(ClientError::Parse(format!("Malformed reply line: '{line}'")));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("Invalid reply code: '{line}'")))?;

        let is_last = match bytes.get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(&c) => {
                return Err(ClientError::Parse(format!(
                    "Invalid separator '{}' in reply line: '{line}'",
                    char::from(c)
                )));
            }
        };

        Ok(Self {
            code,
            is_last,
            text: line.get(4..).unwrap_or_default().to_string(),
        })
    }
}

/// Class of a reply, taken from its first digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 2xx
    Positive,
    /// 3xx
    Intermediate,
    /// 4xx
    Transient,
    /// 5xx
    Permanent,
    /// Anything else.
    Invalid,
}

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    #[must_use]
    pub const fn class(&self) -> ReplyClass {
        match self.code / 100 {
            2 => ReplyClass::Positive,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::Transient,
            5 => ReplyClass::Permanent,
            _ => ReplyClass::Invalid,
        }
    }

    /// All lines joined with a space, as recorded against a failed email.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    /// Whether any line advertises `keyword` as an ESMTP capability.
    #[must_use]
    pub fn advertises(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }
}

/// Accumulates inbound bytes and hands out complete replies.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    data: Vec<u8>,
}

impl ReplyBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Parse` if the buffered data grows beyond 1MB
    /// without completing a reply.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if self.data.len() + bytes.len() > MAX_BUFFER_SIZE {
            return Err(ClientError::Parse(format!(
                "Reply too large (exceeds {MAX_BUFFER_SIZE} bytes)"
            )));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Take the next complete reply out of the buffer, if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if a complete line is malformed, or if the lines of a
    /// multi-line reply disagree on the code.
    pub fn next_reply(&mut self) -> Result<Option<Reply>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(offset) = self.data[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &self.data[consumed..consumed + offset];
            consumed += offset + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = ReplyLine::parse(std::str::from_utf8(raw)?)?;
            match code {
                Some(code) if code != line.code => {
                    return Err(ClientError::Parse(format!(
                        "Reply code mismatch in multi-line reply: expected {code}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
                None => code = Some(line.code),
            }
            lines.push(line.text);

            if line.is_last {
                self.data.drain(..consumed);
                return Ok(Some(Reply::new(line.code, lines)));
            }
        }

        Ok(None)
    }

    /// Drop everything buffered, used when the transport is replaced.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
