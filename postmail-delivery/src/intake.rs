//! Accepting new emails into the pipeline.

use postmail_common::{Email, EmailId, EmailStatus, domain_of};
use postmail_store::Stores;
use tracing::{info, warn};

use crate::IntakeError;

/// A message as submitted, before it has an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl NewEmail {
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Why this email can never be delivered, if it can't.
    fn rejection(&self) -> Option<String> {
        if self.to.is_empty() {
            return Some("no recipients".to_string());
        }

        self.to
            .iter()
            .find(|recipient| domain_of(recipient).is_none())
            .map(|recipient| format!("invalid recipient address: {recipient}"))
    }
}

/// Records new emails and queues them for delivery.
///
/// Emails that fail validation are still recorded, as `failed`, so every
/// submission leaves a trace.
#[derive(Debug, Clone)]
pub struct Intake {
    stores: Stores,
}

impl Intake {
    #[must_use]
    pub const fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// # Errors
    ///
    /// Returns [`IntakeError::Invalid`] for an undeliverable email (already
    /// recorded as `failed`), or [`IntakeError::Store`] if it could not be
    /// recorded or queued.
    pub async fn submit(&self, new: NewEmail) -> Result<EmailId, IntakeError> {
        let id = EmailId::generate();
        let rejection = new.rejection();
        let mut email = Email::new(id.clone(), new.from, new.to, new.subject, new.body);

        if let Some(reason) = rejection {
            email.status = EmailStatus::Failed;
            email.last_error = Some(reason.clone());
            self.stores.emails.insert(email).await?;

            warn!(email_id = %id, %reason, "Rejected email at intake");
            return Err(IntakeError::Invalid { id, reason });
        }

        self.stores.emails.insert(email).await?;
        let entry = self.stores.queue.enqueue(&id).await?;

        info!(email_id = %id, %entry, "Email queued");
        Ok(id)
    }
}
