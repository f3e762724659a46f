//! DKIM signing of outbound messages.

use std::fmt::Debug;

use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::{DkimSigner as MailAuthSigner, Done},
};
use thiserror::Error;

/// Headers covered by the signature.
const SIGNED_HEADERS: [&str; 3] = ["From", "To", "Subject"];

#[derive(Debug, Error)]
pub enum SignError {
    #[error("Invalid DKIM private key: {0}")]
    Key(String),

    #[error("Failed to sign message: {0}")]
    Sign(String),
}

/// Produces the signature header for an assembled message.
pub trait Signer: Send + Sync + Debug {
    /// Sign `message` (headers, blank line and body joined with CRLF) and
    /// return the header to prepend. An empty string means "no header".
    ///
    /// # Errors
    ///
    /// Returns [`SignError`] if the message cannot be signed.
    fn sign(&self, message: &str) -> Result<String, SignError>;
}

/// RSA-SHA256 DKIM signer bound to one domain and selector.
pub struct DkimSigner {
    signer: MailAuthSigner<RsaKey<Sha256>, Done>,
    domain: String,
    selector: String,
}

impl DkimSigner {
    /// # Errors
    ///
    /// Returns [`SignError::Key`] if `private_key` is not a PKCS#8 PEM RSA key.
    pub fn new(
        private_key: &str,
        domain: impl Into<String>,
        selector: impl Into<String>,
    ) -> Result<Self, SignError> {
        let key = RsaKey::<Sha256>::from_pkcs8_pem(private_key)
            .map_err(|err| SignError::Key(err.to_string()))?;
        let domain = domain.into();
        let selector = selector.into();

        let signer = MailAuthSigner::from_key(key)
            .domain(domain.as_str())
            .selector(selector.as_str())
            .headers(SIGNED_HEADERS);

        Ok(Self {
            signer,
            domain,
            selector,
        })
    }
}

impl Debug for DkimSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimSigner")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl Signer for DkimSigner {
    fn sign(&self, message: &str) -> Result<String, SignError> {
        let signature = self
            .signer
            .sign(message.as_bytes())
            .map_err(|err| SignError::Sign(err.to_string()))?;

        Ok(signature.to_header())
    }
}

/// Sends messages without a signature header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsigned;

impl Signer for Unsigned {
    fn sign(&self, _message: &str) -> Result<String, SignError> {
        Ok(String::new())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TEST_KEY: &str = include_str!("../test/dkim.key");

    const MESSAGE: &str = "Subject: Hello\r\nFrom: alice@example.org\r\nTo: bob@example.com\r\n\r\nHi Bob";

    #[test]
    fn rejects_malformed_keys() {
        let result = DkimSigner::new("not a key", "example.org", "mail");
        assert!(matches!(result, Err(SignError::Key(_))));
    }

    #[test]
    fn signs_with_domain_and_selector() {
        let signer = DkimSigner::new(TEST_KEY, "example.org", "mail").unwrap();

        let header = signer.sign(MESSAGE).unwrap();

        assert!(header.starts_with("DKIM-Signature:"), "{header}");
        assert!(header.contains("a=rsa-sha256"));
        assert!(header.contains("d=example.org"));
        assert!(header.contains("s=mail"));
        assert!(header.contains("b="));
    }

    #[test]
    fn signer_is_reusable() {
        let signer = DkimSigner::new(TEST_KEY, "example.org", "mail").unwrap();

        let first = signer.sign(MESSAGE).unwrap();
        let second = signer.sign("Subject: Other\r\n\r\nBody").unwrap();

        assert!(first.starts_with("DKIM-Signature:"));
        assert!(second.starts_with("DKIM-Signature:"));
        assert_ne!(first, second);
    }

    #[test]
    fn unsigned_adds_nothing() {
        assert!(matches!(Unsigned.sign("Subject: Hi\r\n\r\nBody"), Ok(header) if header.is_empty()));
    }

    #[test]
    fn debug_hides_the_key() {
        let signer = DkimSigner::new(TEST_KEY, "example.org", "mail").unwrap();
        let rendered = format!("{signer:?}");
        assert!(rendered.contains("example.org"));
        assert!(rendered.contains("mail"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
