//! Mock SMTP server for end-to-end delivery tests
#![allow(dead_code)] // Not every test binary uses every knob
//!
//! Each SMTP verb can be given its own reply, and every line the client sends
//! is recorded so tests can check how far a transaction got.
//!
//! ```rust,ignore
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_to_response(550, "5.1.1 User unknown")
//!     .build()
//!     .await?;
//!
//! // point the engine at server.addr() ...
//!
//! assert!(server.saw("RCPT"));
//! server.shutdown();
//! ```

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo_capabilities: Vec<String>,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    /// Close the socket without replying once this verb arrives.
    hang_up_on: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.test.example ESMTP"),
            ehlo_capabilities: vec!["mock.test.example".to_string(), "SIZE 10000000".to_string()],
            mail_from: Reply::new(250, "2.1.0 OK"),
            rcpt_to: Reply::new(250, "2.1.5 OK"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "2.0.0 OK: queued"),
            quit: Reply::new(221, "2.0.0 Bye"),
            hang_up_on: None,
        }
    }
}

impl Script {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let last = self.ehlo_capabilities.len().saturating_sub(1);
        self.ehlo_capabilities
            .iter()
            .enumerate()
            .map(|(i, capability)| {
                let separator = if i == last { ' ' } else { '-' };
                format!("250{separator}{capability}\r\n")
            })
            .collect::<String>()
            .into_bytes()
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command line received, across all connections.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Whether any command starting with `verb` was received.
    #[must_use]
    pub fn saw(&self, verb: &str) -> bool {
        self.received
            .lock()
            .iter()
            .any(|line| line.to_ascii_uppercase().starts_with(verb))
    }

    /// Message bodies accepted after `DATA`.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        stream: TcpStream,
        script: Arc<Script>,
        received: Arc<Mutex<Vec<String>>>,
        messages: Arc<Mutex<Vec<String>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(&script.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            let mut line = String::new();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let command = line.trim_end().to_string();
            tracing::debug!("Mock server received: {command}");
            received.lock().push(command.clone());

            let verb = command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();

            if script.hang_up_on.as_deref() == Some(verb.as_str()) {
                return Ok(());
            }

            let reply = match verb.as_str() {
                "EHLO" => script.ehlo_bytes(),
                "HELO" => Reply::new(250, "mock.test.example").to_bytes(),
                "MAIL" => script.mail_from.to_bytes(),
                "RCPT" => script.rcpt_to.to_bytes(),
                "DATA" => {
                    writer.write_all(&script.data.to_bytes()).await?;
                    writer.flush().await?;
                    if script.data.code != 354 {
                        continue;
                    }

                    let mut body = String::new();
                    loop {
                        let mut data_line = String::new();
                        if reader.read_line(&mut data_line).await? == 0 {
                            return Ok(());
                        }
                        if data_line.trim_end() == "." {
                            break;
                        }
                        body.push_str(&data_line);
                    }
                    messages.lock().push(body);
                    script.data_end.to_bytes()
                }
                "QUIT" => {
                    writer.write_all(&script.quit.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "RSET" | "NOOP" => Reply::new(250, "2.0.0 OK").to_bytes(),
                _ => Reply::new(502, "5.5.2 Command not implemented").to_bytes(),
            };

            writer.write_all(&reply).await?;
            writer.flush().await?;
        }
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    /// Drop the connection, without replying, when `verb` arrives.
    #[must_use]
    pub fn with_hang_up_on(mut self, verb: &str) -> Self {
        self.script.hang_up_on = Some(verb.to_ascii_uppercase());
        self
    }

    /// Bind to a free local port and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if no port could be bound.
    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let received = Arc::new(Mutex::new(Vec::new()));
        let messages = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = MockSmtpServer {
            addr,
            received: Arc::clone(&received),
            messages: Arc::clone(&messages),
            connections: Arc::clone(&connections),
            shutdown: Arc::clone(&shutdown),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                // Poll so the shutdown flag is noticed.
                let Ok(Ok((stream, _peer))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                connections.fetch_add(1, Ordering::Relaxed);
                let script = Arc::clone(&script);
                let received = Arc::clone(&received);
                let messages = Arc::clone(&messages);
                tokio::spawn(async move {
                    if let Err(err) =
                        MockSmtpServer::handle_client(stream, script, received, messages).await
                    {
                        tracing::debug!("Mock server client error: {err}");
                    }
                });
            }
        });

        Ok(server)
    }
}
