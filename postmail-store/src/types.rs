use std::collections::BTreeMap;

use postmail_common::EmailId;
use thiserror::Error;

/// Payload field holding the referenced email id.
pub const EMAIL_ID_FIELD: &str = "emailId";

/// Identifier of a queue entry.
///
/// A ULID, so ids sort by creation time and the queue hands out entries in
/// the order they were added.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueEntryId {
    id: ulid::Ulid,
}

impl QueueEntryId {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Parse an id previously produced by `Display`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        ulid::Ulid::from_string(value).ok().map(Self::new)
    }
}

impl std::fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A queue payload that does not reference an email.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoisonMessage {
    #[error("queue entry {0} has no `emailId` field")]
    MissingEmailId(QueueEntryId),

    #[error("queue entry {0} has an empty `emailId` field")]
    EmptyEmailId(QueueEntryId),
}

/// An entry handed to a consumer by [`crate::Queue::dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    /// Raw payload, as stored.
    pub fields: BTreeMap<String, String>,
    /// How many times this entry has been handed to a consumer, this time
    /// included.
    pub deliveries: u32,
}

impl QueueEntry {
    /// Validate the payload and extract the referenced email id.
    ///
    /// # Errors
    ///
    /// Returns a [`PoisonMessage`] when the email id is missing or blank.
    pub fn email_id(&self) -> Result<EmailId, PoisonMessage> {
        let value = self
            .fields
            .get(EMAIL_ID_FIELD)
            .ok_or_else(|| PoisonMessage::MissingEmailId(self.id.clone()))?;

        let value = value.trim();
        if value.is_empty() {
            return Err(PoisonMessage::EmptyEmailId(self.id.clone()));
        }

        Ok(EmailId::new(value))
    }
}

/// The payload written for a reference to `email_id`.
#[must_use]
pub fn payload_for(email_id: &EmailId) -> BTreeMap<String, String> {
    BTreeMap::from([(EMAIL_ID_FIELD.to_string(), email_id.to_string())])
}
