pub mod email;
pub mod logging;

pub use email::{Email, EmailId, EmailStatus, EmailUpdate, StatusError, domain_of};
pub use tracing;

/// Process-wide lifecycle signal, broadcast from the controller to every
/// long-running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
