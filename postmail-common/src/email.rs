//! The email record shared by intake, the workers and the persistence layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, unique identifier of an email record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmailId(String);

impl EmailId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EmailId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of an email.
///
/// `Sent` and `Failed` are terminal. `Sending` is the checkpoint written
/// before any network I/O and `Retry` marks a transient failure awaiting its
/// reschedule. Both are claimable exactly like `Queued`, so a crash or store
/// outage between those writes leaves the record resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Queued,
    Sending,
    Sent,
    Retry,
    Failed,
}

impl EmailStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a worker holding the lock may start a delivery attempt.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::Sending | Self::Retry)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Email {id} is already {status} and can no longer change")]
    Terminal { id: EmailId, status: EmailStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Email {
    pub id: EmailId,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub status: EmailStatus,
    pub retry_count: u32,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Email {
    /// Build a freshly queued email.
    #[must_use]
    pub fn new(
        id: EmailId,
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            from: from.into(),
            to,
            subject: subject.into(),
            body: body.into(),
            status: EmailStatus::Queued,
            retry_count: 0,
            next_retry: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The recipient delivery is attempted for.
    #[must_use]
    pub fn primary_recipient(&self) -> Option<&str> {
        self.to.first().map(String::as_str)
    }

    /// Domain part of the primary recipient, if it has one.
    #[must_use]
    pub fn recipient_domain(&self) -> Option<&str> {
        self.primary_recipient().and_then(domain_of)
    }

    /// Apply a partial update, refusing to touch a record in a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Terminal`] if the email is already `sent` or
    /// `failed`.
    pub fn apply(&mut self, update: EmailUpdate, now: DateTime<Utc>) -> Result<(), StatusError> {
        if self.status.is_terminal() {
            return Err(StatusError::Terminal {
                id: self.id.clone(),
                status: self.status,
            });
        }

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(next_retry) = update.next_retry {
            self.next_retry = Some(next_retry);
        }
        if let Some(last_error) = update.last_error {
            self.last_error = Some(last_error);
        }
        self.updated_at = now;

        Ok(())
    }
}

/// Domain part of an address, `None` when there is no non-empty domain.
#[must_use]
pub fn domain_of(address: &str) -> Option<&str> {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Some(domain),
        _ => None,
    }
}

/// A set of field changes for an email record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailUpdate {
    pub status: Option<EmailStatus>,
    pub retry_count: Option<u32>,
    pub next_retry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl EmailUpdate {
    #[must_use]
    pub fn status(status: EmailStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    #[must_use]
    pub const fn with_next_retry(mut self, next_retry: DateTime<Utc>) -> Self {
        self.next_retry = Some(next_retry);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}
