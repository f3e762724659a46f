//! Typed error handling for delivery operations.
//!
//! Every failure of a delivery attempt is either:
//! - Transient: worth another attempt later (4xx replies, timeouts, network
//!   and TLS failures, resolver hiccups, rate limiting)
//! - Permanent: will never succeed (5xx replies, invalid recipients, domains
//!   without mail exchanges)

use postmail_smtp::client::ClientError;
use postmail_store::StoreError;
use thiserror::Error;

use crate::{DnsError, SignError};

/// Outcome of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),
}

/// Failures that may succeed on a later attempt.
#[derive(Debug, Error)]
pub enum TransientError {
    /// The server answered with a 4xx reply.
    #[error("{0}")]
    Reply(String),

    /// No reply within the socket timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Connection refused, reset or closed mid-conversation.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The server broke the reply grammar.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookup(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Failures that will not succeed however often they are retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The recipient list is empty or its first entry has no domain.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// Exchanges exist but none of them resolved to an address.
    #[error("No mail server address for domain: {0}")]
    NoAddress(String),

    /// The server answered with a 5xx reply.
    #[error("{0}")]
    Rejected(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::Timeout(domain) => {
                Self::Transient(TransientError::DnsLookup(format!("timed out for {domain}")))
            }
            DnsError::LookupFailed(err) => {
                Self::Transient(TransientError::DnsLookup(err.to_string()))
            }
        }
    }
}

impl From<SignError> for DeliveryError {
    fn from(error: SignError) -> Self {
        Self::Transient(TransientError::Signing(error.to_string()))
    }
}

/// Classify a failed SMTP conversation.
///
/// Only a 5xx reply is permanent. Everything else, including replies that
/// break the protocol, is worth another attempt.
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Permanent { .. } => {
                Self::Permanent(PermanentError::Rejected(error.to_string()))
            }
            ClientError::Transient { .. } => Self::Transient(TransientError::Reply(error.to_string())),
            ClientError::Timeout { stage } => {
                Self::Transient(TransientError::Timeout(format!("during {stage}")))
            }
            ClientError::ConnectionClosed { stage } => Self::Transient(TransientError::Connection(
                format!("closed by peer during {stage}"),
            )),
            ClientError::Io(err) => Self::Transient(TransientError::Connection(err.to_string())),
            ClientError::Tls(message) => Self::Transient(TransientError::Tls(message)),
            ClientError::Parse(_) | ClientError::Unexpected { .. } | ClientError::Utf8(_) => {
                Self::Transient(TransientError::Protocol(error.to_string()))
            }
        }
    }
}

/// Why a worker exited without being asked to.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to connect to the stores: {0}")]
    Connect(#[source] StoreError),

    #[error("Worker task panicked: {0}")]
    Panicked(String),

    #[error("Worker task was cancelled")]
    Cancelled,
}

/// Why a submitted email was not queued.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The email was recorded as `failed` and will not be delivered.
    #[error("Email {id} rejected: {reason}")]
    Invalid {
        id: postmail_common::EmailId,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
