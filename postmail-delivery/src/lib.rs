//! Outbound delivery for postmail
//!
//! This crate provides:
//! - MX resolution and exchange selection for recipient domains
//! - DKIM signing and per-domain rate limiting
//! - The delivery engine driving one SMTP transaction per attempt
//! - Queue workers applying the retry policy to each outcome
//! - A worker pool scaled by queue depth
//! - Intake, which records and queues new emails

mod dns;
mod engine;
mod error;
mod intake;
pub mod policy;
mod pool;
mod rate_limiter;
mod signer;
mod worker;

// Re-export DNS types
pub use dns::{DnsConfig, DnsError, DnsResolver, MailExchange, MxResolver, select_exchange};
// Re-export engine types
pub use engine::{Deliverer, DeliveryEngine, EngineConfig};
// Re-export error types
pub use error::{DeliveryError, IntakeError, PermanentError, TransientError, WorkerError};
pub use intake::{Intake, NewEmail};
pub use policy::{RetryDecision, RetryPolicy};
pub use pool::{
    DeliveryWorkerFactory, PoolConfig, PoolManager, ScaleDecision, WorkerFactory,
    scaling_decision,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use signer::{DkimSigner, SignError, Signer, Unsigned};
pub use worker::{Worker, WorkerConfig};
