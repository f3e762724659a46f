//! Backend implementations for the delivery stores
//!
//! - `memory`: In-process stores shared between every worker of one process

pub mod memory;

pub use memory::{MemoryBackend, MemoryEmailStore, MemoryLockStore, MemoryQueue};
