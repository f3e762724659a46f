pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{MemoryBackend, MemoryEmailStore, MemoryLockStore, MemoryQueue};
pub use config::QueueConfig;
pub use error::{Result, StoreError};
pub use r#trait::{Connector, EmailStore, LockStore, Queue, Stores};
pub use types::{EMAIL_ID_FIELD, PoisonMessage, QueueEntry, QueueEntryId};
