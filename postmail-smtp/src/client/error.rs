//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

use super::stage::Stage;

/// Errors that can end an outbound SMTP conversation.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No bytes arrived (or could be written) within the inactivity timeout.
    #[error("Timed out waiting for the server during {stage}")]
    Timeout { stage: Stage },

    /// Connection was closed by the peer mid-conversation.
    #[error("Connection closed unexpectedly during {stage}")]
    ConnectionClosed { stage: Stage },

    /// Failed to parse an SMTP reply from the server.
    #[error("Failed to parse SMTP reply: {0}")]
    Parse(String),

    /// The server answered with a 4xx reply.
    #[error("{code} {message} (during {stage})")]
    Transient {
        stage: Stage,
        code: u16,
        message: String,
    },

    /// The server answered with a 5xx reply.
    #[error("{code} {message} (during {stage})")]
    Permanent {
        stage: Stage,
        code: u16,
        message: String,
    },

    /// The server answered with a code outside the 2xx-5xx range, or replied
    /// in a stage where no reply was expected.
    #[error("Unexpected reply {code} {message} (during {stage})")]
    Unexpected {
        stage: Stage,
        code: u16,
        message: String,
    },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    Tls(String),

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Only a 5xx reply is a permanent failure; everything else is worth
    /// another attempt later.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    /// The reply code that caused the failure, if the server sent one.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Transient { code, .. }
            | Self::Permanent { code, .. }
            | Self::Unexpected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
