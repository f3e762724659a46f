use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use postmail_common::{Email, EmailId, EmailUpdate};
use tokio::{sync::Notify, time::Instant};

use crate::{
    QueueConfig, QueueEntry, QueueEntryId, Result, StoreError,
    r#trait::{Connector, EmailStore, LockStore, Queue, Stores},
    types::payload_for,
};

/// Shared on/off switch, so tests can make every store fail at once.
#[derive(Debug, Clone)]
struct Availability(Arc<AtomicBool>);

impl Availability {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn check(&self) -> Result<()> {
        if self.0.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory backend disabled".to_string()))
        }
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::Release);
    }
}

/// Email records held in a `DashMap`.
#[derive(Debug, Clone)]
pub struct MemoryEmailStore {
    emails: Arc<DashMap<EmailId, Email>>,
    available: Availability,
}

impl MemoryEmailStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_availability(Availability::new())
    }

    fn with_availability(available: Availability) -> Self {
        Self {
            emails: Arc::new(DashMap::new()),
            available,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.emails.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

impl Default for MemoryEmailStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailStore for MemoryEmailStore {
    async fn insert(&self, email: Email) -> Result<()> {
        self.available.check()?;

        match self.emails.entry(email.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(email.id)),
            Entry::Vacant(slot) => {
                slot.insert(email);
                Ok(())
            }
        }
    }

    async fn load(&self, id: &EmailId) -> Result<Option<Email>> {
        self.available.check()?;
        Ok(self.emails.get(id).map(|email| email.value().clone()))
    }

    async fn update(&self, id: &EmailId, update: EmailUpdate) -> Result<Email> {
        self.available.check()?;

        let mut email = self
            .emails
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        email.apply(update, Utc::now())?;

        Ok(email.value().clone())
    }
}

#[derive(Debug)]
struct Claim {
    consumer: String,
    claimed_at: Instant,
}

#[derive(Debug)]
struct Slot {
    fields: BTreeMap<String, String>,
    visible_at: Instant,
    claim: Option<Claim>,
    deliveries: u32,
}

impl Slot {
    /// The instant this slot can next be handed out.
    fn available_at(&self, visibility_timeout: Duration) -> Instant {
        self.claim.as_ref().map_or(self.visible_at, |claim| {
            (claim.claimed_at + visibility_timeout).max(self.visible_at)
        })
    }
}

/// A queue of entries ordered by id.
///
/// An entry handed to a consumer stays outstanding until acknowledged. If the
/// consumer does not acknowledge it within the visibility timeout, the entry
/// is handed out again and its delivery counter goes up.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    entries: Arc<Mutex<BTreeMap<QueueEntryId, Slot>>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    available: Availability,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_availability(config, Availability::new())
    }

    fn with_availability(config: &QueueConfig, available: Availability) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            notify: Arc::new(Notify::new()),
            visibility_timeout: config.visibility_timeout(),
            available,
        }
    }

    /// Add an entry with an arbitrary payload, bypassing the email reference
    /// format.
    pub fn push_fields(&self, fields: BTreeMap<String, String>) -> QueueEntryId {
        self.push(fields, Instant::now())
    }

    /// Every outstanding entry, claimed or not.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries
            .lock()
            .iter()
            .map(|(id, slot)| QueueEntry {
                id: id.clone(),
                fields: slot.fields.clone(),
                deliveries: slot.deliveries,
            })
            .collect()
    }

    fn push(&self, fields: BTreeMap<String, String>, visible_at: Instant) -> QueueEntryId {
        let id = QueueEntryId::generate();
        self.entries.lock().insert(
            id.clone(),
            Slot {
                fields,
                visible_at,
                claim: None,
                deliveries: 0,
            },
        );
        self.notify.notify_waiters();
        id
    }

    /// Claim what is available now and report when the next entry becomes
    /// available if nothing was.
    fn claim(
        &self,
        consumer: &str,
        count: usize,
        now: Instant,
    ) -> (Vec<QueueEntry>, Option<Instant>) {
        let mut entries = self.entries.lock();
        let mut claimed = Vec::new();
        let mut next = None::<Instant>;

        for (id, slot) in entries.iter_mut() {
            let available_at = slot.available_at(self.visibility_timeout);
            if available_at > now {
                next = Some(next.map_or(available_at, |n| n.min(available_at)));
                continue;
            }

            if let Some(previous) = &slot.claim {
                tracing::debug!(
                    entry = %id,
                    previous = %previous.consumer,
                    consumer,
                    "Reclaiming unacknowledged queue entry"
                );
            }

            slot.claim = Some(Claim {
                consumer: consumer.to_string(),
                claimed_at: now,
            });
            slot.deliveries = slot.deliveries.saturating_add(1);
            claimed.push(QueueEntry {
                id: id.clone(),
                fields: slot.fields.clone(),
                deliveries: slot.deliveries,
            });

            if claimed.len() >= count {
                break;
            }
        }

        (claimed, next)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, email_id: &EmailId) -> Result<QueueEntryId> {
        self.available.check()?;
        Ok(self.push(payload_for(email_id), Instant::now()))
    }

    async fn enqueue_after(&self, email_id: &EmailId, delay: Duration) -> Result<QueueEntryId> {
        self.available.check()?;
        Ok(self.push(payload_for(email_id), Instant::now() + delay))
    }

    async fn dequeue(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<QueueEntry>> {
        self.available.check()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking, so an enqueue between the
            // claim and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (claimed, next) = self.claim(consumer, count, now);
            if !claimed.is_empty() || now >= deadline {
                return Ok(claimed);
            }

            let wake = next.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn acknowledge(&self, id: &QueueEntryId) -> Result<bool> {
        self.available.check()?;

        let mut entries = self.entries.lock();
        let claimed = entries.get(id).is_some_and(|slot| slot.claim.is_some());
        if claimed {
            entries.remove(id);
        }

        Ok(claimed)
    }

    async fn delete(&self, id: &QueueEntryId) -> Result<bool> {
        self.available.check()?;
        Ok(self.entries.lock().remove(id).is_some())
    }

    async fn depth(&self) -> Result<usize> {
        self.available.check()?;
        Ok(self.entries.lock().len())
    }
}

#[derive(Debug, Clone)]
struct Lock {
    holder: String,
    expires_at: Instant,
}

/// Per-email locks with lazy expiry.
#[derive(Debug, Clone)]
pub struct MemoryLockStore {
    locks: Arc<DashMap<EmailId, Lock>>,
    available: Availability,
}

impl MemoryLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_availability(Availability::new())
    }

    fn with_availability(available: Availability) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            available,
        }
    }

    /// The current holder of the lock for `email_id`, if unexpired.
    #[must_use]
    pub fn holder(&self, email_id: &EmailId) -> Option<String> {
        let now = Instant::now();
        self.locks
            .get(email_id)
            .filter(|lock| lock.expires_at > now)
            .map(|lock| lock.holder.clone())
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, email_id: &EmailId, holder: &str, ttl: Duration) -> Result<bool> {
        self.available.check()?;

        let now = Instant::now();
        let lock = Lock {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        match self.locks.entry(email_id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().expires_at <= now {
                    existing.insert(lock);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(lock);
                Ok(true)
            }
        }
    }

    async fn exists(&self, email_id: &EmailId) -> Result<bool> {
        self.available.check()?;

        let now = Instant::now();
        self.locks
            .remove_if(email_id, |_, lock| lock.expires_at <= now);
        Ok(self.locks.contains_key(email_id))
    }

    async fn release(&self, email_id: &EmailId, holder: &str) -> Result<bool> {
        self.available.check()?;

        Ok(self
            .locks
            .remove_if(email_id, |_, lock| lock.holder == holder)
            .is_some())
    }
}

/// All three stores in one process.
///
/// Every connection returned by [`Connector::connect`] shares the same data.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    pub emails: MemoryEmailStore,
    pub queue: MemoryQueue,
    pub locks: MemoryLockStore,
    available: Availability,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(config: &QueueConfig) -> Self {
        let available = Availability::new();
        Self {
            emails: MemoryEmailStore::with_availability(available.clone()),
            queue: MemoryQueue::with_availability(config, available.clone()),
            locks: MemoryLockStore::with_availability(available.clone()),
            available,
        }
    }

    /// Make every store operation and new connection succeed or fail with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    #[must_use]
    pub fn stores(&self) -> Stores {
        Stores {
            emails: Arc::new(self.emails.clone()),
            queue: Arc::new(self.queue.clone()),
            locks: Arc::new(self.locks.clone()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> Result<Stores> {
        self.available.check()?;
        Ok(self.stores())
    }
}
