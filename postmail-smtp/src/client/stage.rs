//! The outbound conversation as an explicit stage machine.
//!
//! [`advance`] is a pure function from the current stage and the server's
//! reply to the next stage and the action the transport must perform.

use std::fmt;

use super::{
    error::ClientError,
    reply::{Reply, ReplyClass},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Connected, waiting for the server banner.
    Connect,
    Ehlo,
    StartTls,
    /// Second EHLO, sent over the secured transport.
    EhloTls,
    MailFrom,
    RcptTo,
    Data,
    /// Message content has been written, waiting for the end-of-data reply.
    Sending,
    Quit,
    Done,
    Failed,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::EhloTls => "EHLO (TLS)",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::Sending => "SENDING",
            Self::Quit => "QUIT",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command line written to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    StartTls,
    MailFrom(String),
    RcptTo(String),
    Data,
    Quit,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(name) => write!(f, "EHLO {name}"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::MailFrom(sender) => write!(f, "MAIL FROM:<{sender}>"),
            Self::RcptTo(recipient) => write!(f, "RCPT TO:<{recipient}>"),
            Self::Data => f.write_str("DATA"),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}

/// What the transport must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Command),
    /// Perform the TLS handshake in place, then send the second EHLO.
    UpgradeTls,
    /// Write the message content followed by the end-of-data marker.
    SendMessage,
    /// The conversation completed successfully.
    Finish,
}

/// The envelope data a conversation needs to build its commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub helo_name: String,
    pub sender: String,
    pub recipient: String,
}

impl Envelope {
    #[must_use]
    pub fn new(
        helo_name: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            helo_name: helo_name.into(),
            sender: sender.into(),
            recipient: recipient.into(),
        }
    }
}

/// Compute the next stage and action for `reply` received in `stage`.
///
/// 4xx replies abort as transient and 5xx replies as permanent, at every
/// stage. 2xx replies proceed, and so does 3xx in answer to `DATA`; a 3xx
/// anywhere else is unexpected.
///
/// # Errors
///
/// Returns the [`ClientError`] describing why the conversation must stop.
pub fn advance(
    stage: Stage,
    reply: &Reply,
    secured: bool,
    envelope: &Envelope,
) -> Result<(Stage, Action), ClientError> {
    match reply.class() {
        ReplyClass::Positive => {}
        ReplyClass::Intermediate if stage == Stage::Data => {}
        ReplyClass::Transient => {
            return Err(ClientError::Transient {
                stage,
                code: reply.code,
                message: reply.message(),
            });
        }
        ReplyClass::Permanent => {
            return Err(ClientError::Permanent {
                stage,
                code: reply.code,
                message: reply.message(),
            });
        }
        ReplyClass::Intermediate | ReplyClass::Invalid => {
            return Err(ClientError::Unexpected {
                stage,
                code: reply.code,
                message: reply.message(),
            });
        }
    }

    let next = match stage {
        Stage::Connect => (Stage::Ehlo, Action::Send(Command::Ehlo(envelope.helo_name.clone()))),
        Stage::Ehlo if !secured && reply.advertises("STARTTLS") => {
            (Stage::StartTls, Action::Send(Command::StartTls))
        }
        Stage::Ehlo | Stage::EhloTls => (
            Stage::MailFrom,
            Action::Send(Command::MailFrom(envelope.sender.clone())),
        ),
        Stage::StartTls => (Stage::EhloTls, Action::UpgradeTls),
        Stage::MailFrom => (
            Stage::RcptTo,
            Action::Send(Command::RcptTo(envelope.recipient.clone())),
        ),
        Stage::RcptTo => (Stage::Data, Action::Send(Command::Data)),
        Stage::Data => (Stage::Sending, Action::SendMessage),
        Stage::Sending => (Stage::Quit, Action::Send(Command::Quit)),
        Stage::Quit => (Stage::Done, Action::Finish),
        Stage::Done | Stage::Failed => {
            return Err(ClientError::Unexpected {
                stage,
                code: reply.code,
                message: reply.message(),
            });
        }
    };

    Ok(next)
}
