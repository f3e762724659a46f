//! Socket driver for a [`Session`].

use std::{net::SocketAddr, time::Duration};

use postmail_common::outgoing;
use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use super::{
    connection::ClientConnection,
    error::{ClientError, Result},
    message::frame,
    session::Session,
    stage::{Action, Command, Envelope, Stage},
};

/// Size of each socket read.
const READ_CHUNK: usize = 8192;

/// Transport settings for one outbound conversation.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Inactivity timeout applied to the connect and to every read and write.
    pub timeout: Duration,
    /// Skip certificate validation after STARTTLS.
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

/// Drives one conversation with one mail exchange.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    server_name: String,
    options: ClientOptions,
}

impl SmtpClient {
    /// Open a TCP connection to `addr`.
    ///
    /// `server_name` is the exchange hostname, used for TLS verification.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Timeout` if the connection is not established
    /// within the inactivity timeout, or `ClientError::Io` if it is refused.
    pub async fn connect(
        addr: SocketAddr,
        server_name: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        let stream = timeout(options.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout {
                stage: Stage::Connect,
            })??;

        debug!(%addr, "Connected to mail exchange");

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            server_name: server_name.into(),
            options,
        })
    }

    /// Run the whole conversation for `envelope`, sending `content` (the
    /// signed message, without the end-of-data marker) in the DATA phase.
    ///
    /// The connection is always closed before this returns.
    ///
    /// # Errors
    ///
    /// Returns the first failure: a classified 4xx/5xx reply, a timeout, a
    /// closed connection, or a TLS failure.
    pub async fn deliver(mut self, envelope: Envelope, content: &str) -> Result<()> {
        let mut session = Session::new(envelope);
        let result = self.converse(&mut session, content).await;
        if result.is_err() {
            session.fail();
        }
        self.close().await;
        result
    }

    async fn converse(&mut self, session: &mut Session, content: &str) -> Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if let Some(action) = session.next_action()? {
                match action {
                    Action::Send(command) => self.send_command(&command, session.stage()).await?,
                    Action::UpgradeTls => {
                        self.upgrade().await?;
                        let command = session.tls_established();
                        self.send_command(&command, session.stage()).await?;
                    }
                    Action::SendMessage => {
                        outgoing!(">> <message content, {} bytes>", content.len());
                        self.write(&frame(content), session.stage()).await?;
                    }
                    Action::Finish => return Ok(()),
                }
                continue;
            }

            let stage = session.stage();
            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed { stage })?;
            let read = timeout(self.options.timeout, connection.read(&mut chunk))
                .await
                .map_err(|_| ClientError::Timeout { stage })??;
            if read == 0 {
                return Err(ClientError::ConnectionClosed { stage });
            }
            session.feed(&chunk[..read])?;
        }
    }

    async fn send_command(&mut self, command: &Command, stage: Stage) -> Result<()> {
        outgoing!(">> {command}");
        self.write(format!("{command}\r\n").as_bytes(), stage).await
    }

    async fn write(&mut self, data: &[u8], stage: Stage) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed { stage })?;
        timeout(self.options.timeout, connection.write_all(data))
            .await
            .map_err(|_| ClientError::Timeout { stage })??;
        Ok(())
    }

    async fn upgrade(&mut self) -> Result<()> {
        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed {
            stage: Stage::StartTls,
        })?;
        let upgraded = timeout(
            self.options.timeout,
            connection.upgrade(&self.server_name, self.options.accept_invalid_certs),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            stage: Stage::StartTls,
        })??;
        debug!(server = %self.server_name, "Connection upgraded to TLS");
        self.connection = Some(upgraded);
        Ok(())
    }

    async fn close(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        match timeout(self.options.timeout, connection.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "Error while closing connection"),
            Err(_) => debug!("Timed out closing connection"),
        }
    }
}
