//! One delivery attempt for one email.

use std::{fmt::Debug, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use postmail_common::{Email, internal};
use postmail_smtp::client::{ClientOptions, Envelope, OutboundMessage, SmtpClient};
use serde::Deserialize;
use tracing::info;

use crate::{
    DeliveryError, MxResolver, PermanentError, RateLimiter, Signer, TransientError,
    dns::select_exchange,
};

/// Performs a single delivery attempt. Retrying is the caller's business.
#[async_trait]
pub trait Deliverer: Send + Sync + Debug {
    /// # Errors
    ///
    /// Returns [`DeliveryError::Transient`] or [`DeliveryError::Permanent`]
    /// describing why the email was not accepted.
    async fn deliver(&self, email: &Email) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Name sent with `EHLO` (default: localhost)
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Port to connect to on the exchange (default: 587)
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Socket inactivity timeout in milliseconds (default: 30000)
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Accept invalid TLS certificates after STARTTLS
    ///
    /// **SECURITY WARNING**: makes every upgraded connection vulnerable to
    /// interception. Only for testing against self-signed servers.
    ///
    /// Default: `false`
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

const fn default_smtp_port() -> u16 {
    587
}

const fn default_socket_timeout_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            helo_name: default_helo_name(),
            smtp_port: default_smtp_port(),
            socket_timeout_ms: default_socket_timeout_ms(),
            accept_invalid_certs: false,
        }
    }
}

impl EngineConfig {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: Duration::from_millis(self.socket_timeout_ms),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

/// Validates, resolves, signs and sends one email over SMTP.
#[derive(Debug)]
pub struct DeliveryEngine {
    resolver: Arc<dyn MxResolver>,
    signer: Arc<dyn Signer>,
    rate_limiter: Arc<RateLimiter>,
    config: EngineConfig,
}

impl DeliveryEngine {
    #[must_use]
    pub fn new(
        resolver: Arc<dyn MxResolver>,
        signer: Arc<dyn Signer>,
        rate_limiter: Arc<RateLimiter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resolver,
            signer,
            rate_limiter,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The first recipient and its domain, if the recipient list is usable.
    fn recipient(email: &Email) -> Result<(&str, &str), DeliveryError> {
        let recipient = email.primary_recipient().ok_or_else(|| {
            PermanentError::InvalidRecipient(format!("email {} has no recipients", email.id))
        })?;
        let domain = email
            .recipient_domain()
            .ok_or_else(|| PermanentError::InvalidRecipient(recipient.to_string()))?;

        Ok((recipient, domain))
    }
}

#[async_trait]
impl Deliverer for DeliveryEngine {
    async fn deliver(&self, email: &Email) -> Result<(), DeliveryError> {
        let (recipient, domain) = Self::recipient(email)?;

        if let Err(wait) = self.rate_limiter.check(domain) {
            return Err(TransientError::RateLimited(format!(
                "{domain}, next slot in {}ms",
                wait.as_millis()
            ))
            .into());
        }

        let exchanges = self.resolver.resolve(domain).await?;
        let (exchange, address) = select_exchange(&exchanges)
            .ok_or_else(|| PermanentError::NoAddress(domain.to_string()))?;

        let message = OutboundMessage::new(
            email.subject.as_str(),
            email.from.as_str(),
            email.to.clone(),
            email.body.as_str(),
        );
        let rendered = message.render();
        let signature = self.signer.sign(&rendered)?;
        let content = message.render_signed(&signature);

        let target = SocketAddr::new(address, self.config.smtp_port);
        info!(
            email_id = %email.id,
            exchange = %exchange.exchange,
            %target,
            "Delivering email"
        );

        let client =
            SmtpClient::connect(target, &exchange.exchange, self.config.client_options()).await?;
        client
            .deliver(
                Envelope::new(self.config.helo_name.as_str(), email.from.as_str(), recipient),
                &content,
            )
            .await?;

        internal!(level = DEBUG, "Email {} accepted by {}", email.id, exchange.exchange);
        Ok(())
    }
}
