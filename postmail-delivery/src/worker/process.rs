use chrono::{TimeDelta, Utc};
use postmail_common::{EmailId, EmailStatus, EmailUpdate};
use postmail_store::{QueueEntry, StoreError};
use tracing::{debug, info, warn};

use super::Worker;
use crate::{DeliveryError, RetryDecision};

/// `lastError` recorded on an email whose queue entry was given up on.
pub(crate) const REDELIVERY_LIMIT_EXCEEDED: &str = "redelivery limit exceeded";

impl Worker {
    /// Handle one claimed entry.
    ///
    /// Only store failures are returned; delivery failures are recorded on the
    /// email and the entry is acknowledged.
    pub(super) async fn process(&self, entry: QueueEntry) -> Result<(), StoreError> {
        let email_id = match entry.email_id() {
            Ok(email_id) => email_id,
            Err(poison) => {
                warn!(worker = %self.id, entry = %entry.id, error = %poison, "Dropping poison message");
                self.stores.queue.acknowledge(&entry.id).await?;
                return Ok(());
            }
        };

        if entry.deliveries > self.config.max_deliveries {
            warn!(
                worker = %self.id,
                entry = %entry.id,
                %email_id,
                deliveries = entry.deliveries,
                "Queue entry redelivered too often, giving up"
            );
            return self.abandon(&entry, &email_id).await;
        }

        if self.stores.locks.exists(&email_id).await? {
            debug!(worker = %self.id, entry = %entry.id, %email_id, "Email is locked, skipping");
            return Ok(());
        }

        if !self
            .stores
            .locks
            .try_acquire(&email_id, &self.id, self.config.lock_ttl())
            .await?
        {
            debug!(worker = %self.id, entry = %entry.id, %email_id, "Lost lock race, skipping");
            return Ok(());
        }

        let result = self.process_locked(&entry, &email_id).await;

        let released = self.stores.locks.release(&email_id, &self.id).await;
        match released {
            Ok(false) => {
                warn!(worker = %self.id, %email_id, "Lock expired before release");
            }
            Err(err) if result.is_ok() => return Err(err),
            _ => {}
        }

        result
    }

    /// Fail the email behind an over-delivered entry, then delete the entry.
    ///
    /// A lock held by someone else means a worker is still on the email and
    /// will record its outcome, so the record is left to them.
    async fn abandon(&self, entry: &QueueEntry, email_id: &EmailId) -> Result<(), StoreError> {
        if self
            .stores
            .locks
            .try_acquire(email_id, &self.id, self.config.lock_ttl())
            .await?
        {
            let result = self.fail_abandoned(email_id).await;
            let released = self.stores.locks.release(email_id, &self.id).await;
            result?;
            released?;
        } else {
            debug!(worker = %self.id, %email_id, "Email is locked, leaving its record to the holder");
        }

        self.stores.queue.delete(&entry.id).await?;
        Ok(())
    }

    async fn fail_abandoned(&self, email_id: &EmailId) -> Result<(), StoreError> {
        if let Some(email) = self.stores.emails.load(email_id).await?
            && !email.status.is_terminal()
        {
            self.stores
                .emails
                .update(
                    email_id,
                    EmailUpdate::status(EmailStatus::Failed).with_error(REDELIVERY_LIMIT_EXCEEDED),
                )
                .await?;
            warn!(
                worker = %self.id,
                %email_id,
                status = %email.status,
                "Email failed, redelivery limit exceeded"
            );
        }

        Ok(())
    }

    async fn process_locked(&self, entry: &QueueEntry, email_id: &EmailId) -> Result<(), StoreError> {
        let Some(email) = self.stores.emails.load(email_id).await? else {
            warn!(worker = %self.id, entry = %entry.id, %email_id, "Email record not found");
            self.stores.queue.acknowledge(&entry.id).await?;
            return Ok(());
        };

        if !email.status.is_claimable() {
            debug!(
                worker = %self.id,
                entry = %entry.id,
                %email_id,
                status = %email.status,
                "Email not deliverable in its current state"
            );
            self.stores.queue.acknowledge(&entry.id).await?;
            return Ok(());
        }

        let email = if email.status == EmailStatus::Sending {
            email
        } else {
            self.stores
                .emails
                .update(email_id, EmailUpdate::status(EmailStatus::Sending))
                .await?
        };

        match self.deliverer.deliver(&email).await {
            Ok(()) => {
                self.stores.queue.acknowledge(&entry.id).await?;
                self.stores
                    .emails
                    .update(email_id, EmailUpdate::status(EmailStatus::Sent))
                    .await?;
                info!(worker = %self.id, %email_id, "Email sent");
            }
            Err(DeliveryError::Transient(err)) => {
                warn!(worker = %self.id, %email_id, error = %err, "Transient delivery failure");
                self.stores
                    .emails
                    .update(
                        email_id,
                        EmailUpdate::status(EmailStatus::Retry).with_error(err.to_string()),
                    )
                    .await?;
                self.reschedule(email_id, email.retry_count).await?;
                self.stores.queue.acknowledge(&entry.id).await?;
            }
            Err(DeliveryError::Permanent(err)) => {
                warn!(worker = %self.id, %email_id, error = %err, "Permanent delivery failure");
                self.stores
                    .emails
                    .update(
                        email_id,
                        EmailUpdate::status(EmailStatus::Failed).with_error(err.to_string()),
                    )
                    .await?;
                self.stores.queue.acknowledge(&entry.id).await?;
            }
        }

        Ok(())
    }

    async fn reschedule(&self, email_id: &EmailId, previous: u32) -> Result<(), StoreError> {
        match self.policy.decide(previous) {
            RetryDecision::Reschedule { retry_count, delay } => {
                let mut update = EmailUpdate::status(EmailStatus::Queued).with_retry_count(retry_count);
                if let Some(next_retry) = TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                {
                    update = update.with_next_retry(next_retry);
                }

                self.stores.emails.update(email_id, update).await?;
                self.stores.queue.enqueue_after(email_id, delay).await?;
                info!(
                    worker = %self.id,
                    %email_id,
                    retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Email rescheduled"
                );
            }
            RetryDecision::Exhausted { retry_count } => {
                self.stores
                    .emails
                    .update(
                        email_id,
                        EmailUpdate::status(EmailStatus::Failed).with_retry_count(retry_count),
                    )
                    .await?;
                warn!(worker = %self.id, %email_id, retry_count, "Retries exhausted, giving up");
            }
        }

        Ok(())
    }
}
