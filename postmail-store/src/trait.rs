use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use postmail_common::{Email, EmailId, EmailUpdate};

use crate::{QueueEntry, QueueEntryId, Result};

/// Durable email records, keyed by id.
#[async_trait]
pub trait EmailStore: Send + Sync + Debug {
    /// Persist a new record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the id is taken.
    async fn insert(&self, email: Email) -> Result<()>;

    /// Load a record, `None` if it does not exist.
    async fn load(&self, id: &EmailId) -> Result<Option<Email>>;

    /// Apply `update` and return the updated record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` for an unknown id and
    /// `StoreError::TerminalState` if the record is already `sent` or
    /// `failed`.
    async fn update(&self, id: &EmailId, update: EmailUpdate) -> Result<Email>;
}

/// A multi-consumer work queue with per-consumer claim and acknowledge.
#[async_trait]
pub trait Queue: Send + Sync + Debug {
    /// Add an entry referencing `email_id`, visible immediately.
    async fn enqueue(&self, email_id: &EmailId) -> Result<QueueEntryId>;

    /// Add an entry referencing `email_id` that becomes visible after `delay`.
    async fn enqueue_after(&self, email_id: &EmailId, delay: Duration) -> Result<QueueEntryId>;

    /// Claim up to `count` visible entries for `consumer`, waiting at most
    /// `block` for one to arrive. An empty result is not an error.
    async fn dequeue(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>>;

    /// Mark a claimed entry as processed. Returns `false` if the entry was not
    /// outstanding.
    async fn acknowledge(&self, id: &QueueEntryId) -> Result<bool>;

    /// Remove an entry whether or not it is claimed.
    async fn delete(&self, id: &QueueEntryId) -> Result<bool>;

    /// Number of outstanding (not yet acknowledged) entries.
    async fn depth(&self) -> Result<usize>;
}

/// Per-email mutual exclusion with expiry.
#[async_trait]
pub trait LockStore: Send + Sync + Debug {
    /// Atomically take the lock if nobody holds it (or the holder's lock has
    /// expired).
    async fn try_acquire(&self, email_id: &EmailId, holder: &str, ttl: Duration) -> Result<bool>;

    /// Whether an unexpired lock is held by anyone.
    async fn exists(&self, email_id: &EmailId) -> Result<bool>;

    /// Drop the lock if `holder` still owns it. Returns whether a lock was
    /// removed.
    async fn release(&self, email_id: &EmailId, holder: &str) -> Result<bool>;
}

/// One set of connections to the three stores.
#[derive(Debug, Clone)]
pub struct Stores {
    pub emails: Arc<dyn EmailStore>,
    pub queue: Arc<dyn Queue>,
    pub locks: Arc<dyn LockStore>,
}

/// Opens connections to the stores. Each worker connects on its own.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the backing services cannot be
    /// reached.
    async fn connect(&self) -> Result<Stores>;
}
