//! Socket-free driver for one outbound conversation.
//!
//! The transport feeds raw bytes in with [`Session::feed`] and asks for the
//! next [`Action`] with [`Session::next_action`]. Nothing here touches the
//! network, so the whole conversation can be exercised with byte chunks.

use postmail_common::incoming;

use super::{
    error::Result,
    reply::{Reply, ReplyBuffer},
    stage::{Action, Command, Envelope, Stage, advance},
};

#[derive(Debug)]
pub struct Session {
    stage: Stage,
    secured: bool,
    buffer: ReplyBuffer,
    envelope: Envelope,
    transitions: usize,
    last_reply: Option<Reply>,
}

impl Session {
    #[must_use]
    pub fn new(envelope: Envelope) -> Self {
        Self {
            stage: Stage::Connect,
            secured: false,
            buffer: ReplyBuffer::new(),
            envelope,
            transitions: 0,
            last_reply: None,
        }
    }

    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub const fn is_secured(&self) -> bool {
        self.secured
    }

    /// Number of stage transitions taken so far.
    #[must_use]
    pub const fn transitions(&self) -> usize {
        self.transitions
    }

    #[must_use]
    pub const fn last_reply(&self) -> Option<&Reply> {
        self.last_reply.as_ref()
    }

    /// Buffer bytes read from the transport.
    ///
    /// # Errors
    ///
    /// Fails if the buffered reply grows past its size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend(bytes).inspect_err(|_| self.fail())
    }

    /// Evaluate the next complete reply, if one is buffered.
    ///
    /// Returns `Ok(None)` while the reply is still incomplete. Any error moves
    /// the session to [`Stage::Failed`].
    ///
    /// # Errors
    ///
    /// Returns the classified failure for 4xx/5xx replies, malformed input, or
    /// a reply arriving after the conversation has finished.
    pub fn next_action(&mut self) -> Result<Option<Action>> {
        let reply = match self.buffer.next_reply() {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };

        for line in &reply.lines {
            incoming!("<< {} {line}", reply.code);
        }

        let outcome = advance(self.stage, &reply, self.secured, &self.envelope);
        self.last_reply = Some(reply);

        match outcome {
            Ok((next, action)) => {
                self.stage = next;
                self.transitions += 1;
                Ok(Some(action))
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    /// Record a completed TLS handshake and return the greeting to resend.
    ///
    /// Anything buffered from the plaintext transport is discarded.
    pub fn tls_established(&mut self) -> Command {
        self.buffer.clear();
        self.secured = true;
        Command::Ehlo(self.envelope.helo_name.clone())
    }

    /// Mark the conversation as aborted.
    pub const fn fail(&mut self) {
        self.stage = Stage::Failed;
    }
}
