//! Construction of the message content written after `DATA`.

/// The headers and body of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub body: String,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            from: from.into(),
            to,
            body: body.into(),
        }
    }

    /// Render `Subject`, `From` and `To` headers, a blank line and the body,
    /// joined with CRLF. This is the text handed to the signer.
    #[must_use]
    pub fn render(&self) -> String {
        [
            format!("Subject: {}", self.subject),
            format!("From: {}", self.from),
            format!("To: {}", self.to.join(", ")),
            String::new(),
            normalise_line_endings(&self.body),
        ]
        .join("\r\n")
    }

    /// Render the message with a signature header prepended.
    #[must_use]
    pub fn render_signed(&self, signature_header: &str) -> String {
        let rendered = self.render();
        let header = signature_header.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            rendered
        } else {
            format!("{header}\r\n{rendered}")
        }
    }
}

fn normalise_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Frame message content for the DATA phase: dot-stuff lines starting with
/// `.`, make sure the content ends in CRLF, and append the end-of-data marker.
#[must_use]
pub fn frame(content: &str) -> Vec<u8> {
    let content = normalise_line_endings(content);
    let mut framed = Vec::with_capacity(content.len() + 8);

    for line in content.split_inclusive("\r\n") {
        if line.starts_with('.') {
            framed.push(b'.');
        }
        framed.extend_from_slice(line.as_bytes());
    }

    if !framed.ends_with(b"\r\n") {
        framed.extend_from_slice(b"\r\n");
    }
    framed.extend_from_slice(b".\r\n");
    framed
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage::new(
            "Greetings",
            "alice@example.org",
            vec!["bob@example.com".to_string(), "carol@example.com".to_string()],
            "Hello Bob\nBye",
        )
    }

    #[test]
    fn renders_headers_and_body() {
        assert_eq!(
            message().render(),
            "Subject: Greetings\r\nFrom: alice@example.org\r\nTo: bob@example.com, carol@example.com\r\n\r\nHello Bob\r\nBye"
        );
    }

    #[test]
    fn signature_is_prepended() {
        let signed = message().render_signed("DKIM-Signature: v=1; d=example.org\r\n");
        assert!(signed.starts_with("DKIM-Signature: v=1; d=example.org\r\nSubject: Greetings\r\n"));
        assert_eq!(message().render_signed(""), message().render());
    }

    #[test]
    fn frame_terminates_content() {
        assert_eq!(frame("Subject: x\r\n\r\nbody"), b"Subject: x\r\n\r\nbody\r\n.\r\n");
        assert_eq!(frame("body\r\n"), b"body\r\n.\r\n");
    }

    #[test]
    fn frame_dot_stuffs() {
        assert_eq!(
            frame("Subject: x\r\n\r\n.\r\n..hidden\r\nok"),
            b"Subject: x\r\n\r\n..\r\n...hidden\r\nok\r\n.\r\n"
        );
    }
}
