//! Error types for the postmail-store crate.

use postmail_common::{EmailId, EmailStatus, StatusError};
use thiserror::Error;

use crate::QueueEntryId;

/// Failure of a store operation.
///
/// Every variant except [`StoreError::TerminalState`] and
/// [`StoreError::AlreadyExists`] means the store itself misbehaved; callers
/// treat those as a resource problem and retry later.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing service could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// No email record with this id.
    #[error("Email not found: {0}")]
    NotFound(EmailId),

    /// An email record with this id already exists.
    #[error("Email already exists: {0}")]
    AlreadyExists(EmailId),

    /// The record is `sent` or `failed` and may not change any more.
    #[error("Email {id} is already {status}")]
    TerminalState { id: EmailId, status: EmailStatus },

    /// No queue entry with this id.
    #[error("Queue entry not found: {0}")]
    EntryNotFound(QueueEntryId),

    /// Internal error in the backing service.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the failure is about the store rather than the data in it.
    #[must_use]
    pub const fn is_resource(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Internal(_))
    }
}

impl From<StatusError> for StoreError {
    fn from(error: StatusError) -> Self {
        match error {
            StatusError::Terminal { id, status } => Self::TerminalState { id, status },
        }
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
