//! Queue consumer
//!
//! A [`Worker`] claims batches of queue entries, takes the per-email lock,
//! runs one delivery attempt and records the outcome. It keeps going until
//! its stop flag is raised; store failures only pause it.

mod process;

use std::{sync::Arc, time::Duration};

use postmail_common::internal;
use postmail_store::{StoreError, Stores};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::{Deliverer, RetryPolicy};

const fn default_batch_size() -> usize {
    5
}

const fn default_block_ms() -> u64 {
    5000
}

const fn default_lock_ttl_secs() -> u64 {
    60
}

const fn default_error_pause_ms() -> u64 {
    1000
}

const fn default_max_deliveries() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Entries claimed per dequeue (default: 5)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long a dequeue waits for entries, in milliseconds (default: 5000)
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    /// Lifetime of the per-email lock, in seconds (default: 60)
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Pause after a store failure, in milliseconds (default: 1000)
    #[serde(default = "default_error_pause_ms")]
    pub error_pause_ms: u64,

    /// An entry handed out more often than this is dropped (default: 10)
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            error_pause_ms: default_error_pause_ms(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

#[derive(Debug)]
pub struct Worker {
    id: String,
    stores: Stores,
    deliverer: Arc<dyn Deliverer>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        stores: Stores,
        deliverer: Arc<dyn Deliverer>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            stores,
            deliverer,
            policy,
            config,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process batches until `stop` turns `true` or its sender goes away.
    ///
    /// Stopping never interrupts a delivery: the current batch finishes first.
    /// Only the wait for new entries is cut short.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        internal!(level = INFO, worker = %self.id, "Worker started");

        while !*stop.borrow_and_update() {
            let claimed = tokio::select! {
                result = self.stores.queue.dequeue(
                    &self.id,
                    self.config.batch_size,
                    Duration::from_millis(self.config.block_ms),
                ) => result,
                _ = stop.changed() => break,
            };

            let result = match claimed {
                Ok(entries) => self.process_batch(entries).await,
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                if err.is_resource() {
                    error!(worker = %self.id, error = %err, "Queue error, pausing");
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_millis(self.config.error_pause_ms)) => {}
                        _ = stop.changed() => break,
                    }
                } else {
                    warn!(worker = %self.id, error = %err, "Entry processing failed");
                }
            }
        }

        internal!(level = INFO, worker = %self.id, "Worker stopped");
    }

    /// Claim and process a single batch, returning how many entries were
    /// handed out.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; the rest of the batch is left for
    /// redelivery.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let entries = self
            .stores
            .queue
            .dequeue(
                &self.id,
                self.config.batch_size,
                Duration::from_millis(self.config.block_ms),
            )
            .await?;
        let count = entries.len();
        self.process_batch(entries).await?;
        Ok(count)
    }

    async fn process_batch(&self, entries: Vec<postmail_store::QueueEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            debug!(worker = %self.id, "No entries in queue");
            return Ok(());
        }

        for entry in entries {
            self.process(entry).await?;
        }

        Ok(())
    }
}
