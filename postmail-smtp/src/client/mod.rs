//! Outbound SMTP client.
//!
//! The conversation is split in two layers:
//!
//! - [`Session`]: a socket-free driver that buffers reply bytes and walks the
//!   [`Stage`] machine (`CONNECT → EHLO → [STARTTLS → EHLO] → MAIL FROM →
//!   RCPT TO → DATA → SENDING → QUIT → DONE`).
//! - [`SmtpClient`]: owns the TCP/TLS connection, applies the inactivity
//!   timeout and performs the [`Action`]s the session asks for.
//!
//! ```no_run
//! use postmail_smtp::client::{ClientOptions, Envelope, SmtpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SmtpClient::connect(
//!     "192.0.2.10:587".parse()?,
//!     "mx.example.com",
//!     ClientOptions::default(),
//! )
//! .await?;
//!
//! client
//!     .deliver(
//!         Envelope::new("localhost", "alice@example.org", "bob@example.com"),
//!         "Subject: Hi\r\nFrom: alice@example.org\r\nTo: bob@example.com\r\n\r\nHello",
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod message;
mod reply;
mod session;
mod smtp_client;
mod stage;

pub use connection::ClientConnection;
pub use error::{ClientError, Result};
pub use message::{OutboundMessage, frame};
pub use reply::{Reply, ReplyBuffer, ReplyClass, ReplyLine};
pub use session::Session;
pub use smtp_client::{ClientOptions, SmtpClient};
pub use stage::{Action, Command, Envelope, Stage, advance};
