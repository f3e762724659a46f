//! Workers delivering through the real engine to a mock SMTP server.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support {
    pub mod mock_server;
}

use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use postmail_common::{Email, EmailId, EmailStatus};
use postmail_delivery::{
    DeliveryEngine, DkimSigner, DnsError, EngineConfig, Intake, MailExchange, MxResolver,
    NewEmail, RateLimiter, RetryPolicy, Signer, Unsigned, Worker, WorkerConfig,
};
use postmail_store::{EmailStore, MemoryBackend, Queue};
use pretty_assertions::assert_eq;
use support::mock_server::MockSmtpServer;
use tokio::sync::watch;

/// Every domain is served by the mock server on loopback.
#[derive(Debug)]
struct Loopback;

#[async_trait]
impl MxResolver for Loopback {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailExchange>>, DnsError> {
        Ok(Arc::new(vec![
            MailExchange::new(format!("mx.{domain}"), 10).with_ipv4(Ipv4Addr::LOCALHOST),
        ]))
    }
}

fn engine(server: &MockSmtpServer) -> Arc<DeliveryEngine> {
    signing_engine(server, Arc::new(Unsigned))
}

fn signing_engine(server: &MockSmtpServer, signer: Arc<dyn Signer>) -> Arc<DeliveryEngine> {
    Arc::new(DeliveryEngine::new(
        Arc::new(Loopback),
        signer,
        Arc::new(RateLimiter::default()),
        EngineConfig {
            helo_name: "postmail.test".to_string(),
            smtp_port: server.port(),
            socket_timeout_ms: 2000,
            accept_invalid_certs: false,
        },
    ))
}

fn worker(backend: &MemoryBackend, server: &MockSmtpServer, policy: RetryPolicy) -> Worker {
    Worker::new(
        "worker-1",
        backend.stores(),
        engine(server),
        policy,
        WorkerConfig {
            block_ms: 50,
            ..WorkerConfig::default()
        },
    )
}

async fn submit(backend: &MemoryBackend) -> EmailId {
    Intake::new(backend.stores())
        .submit(NewEmail::new(
            "alice@example.org",
            vec!["bob@example.com".to_string()],
            "Quarterly report",
            "Numbers attached.",
        ))
        .await
        .unwrap()
}

async fn load(backend: &MemoryBackend, id: &EmailId) -> Email {
    backend.emails.load(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn accepted_email_is_sent() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;

    let handled = worker(&backend, &server, RetryPolicy::default())
        .run_once()
        .await
        .unwrap();
    assert_eq!(handled, 1);

    let email = load(&backend, &id).await;
    assert_eq!(email.status, EmailStatus::Sent);
    assert_eq!(email.last_error, None);
    assert_eq!(backend.queue.depth().await.unwrap(), 0);
    assert_eq!(backend.locks.holder(&id), None);

    let commands = server.commands();
    assert_eq!(commands[0], "EHLO postmail.test");
    assert_eq!(commands[1], "MAIL FROM:<alice@example.org>");
    assert_eq!(commands[2], "RCPT TO:<bob@example.com>");
    assert!(server.saw("QUIT"));

    let messages = server.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Subject: Quarterly report"));
    assert!(messages[0].contains("Numbers attached."));
}

#[tokio::test]
async fn signed_email_carries_dkim_header() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;
    let signer = DkimSigner::new(include_str!("../test/dkim.key"), "example.org", "mail").unwrap();

    Worker::new(
        "worker-1",
        backend.stores(),
        signing_engine(&server, Arc::new(signer)),
        RetryPolicy::default(),
        WorkerConfig {
            block_ms: 50,
            ..WorkerConfig::default()
        },
    )
    .run_once()
    .await
    .unwrap();

    assert_eq!(load(&backend, &id).await.status, EmailStatus::Sent);

    let messages = server.messages();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert!(message.starts_with("DKIM-Signature:"), "{message}");
    assert!(message.contains("d=example.org"));
    assert!(message.contains("s=mail"));
    // The signature precedes the headers it covers.
    let signature = message.find("DKIM-Signature:").unwrap();
    let subject = message.find("Subject: Quarterly report").unwrap();
    assert!(signature < subject);
}

#[tokio::test]
async fn temporary_rejection_at_mail_from_is_rescheduled() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "4.7.1 Greylisted, try again later")
        .build()
        .await
        .unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;
    let before = Utc::now();

    worker(&backend, &server, RetryPolicy::default())
        .run_once()
        .await
        .unwrap();

    let email = load(&backend, &id).await;
    assert_eq!(email.status, EmailStatus::Queued);
    assert_eq!(email.retry_count, 1);
    assert!(email.last_error.as_deref().unwrap().contains("451"));

    let next_retry = email.next_retry.unwrap();
    assert!(next_retry >= before + TimeDelta::seconds(20));
    assert!(next_retry <= Utc::now() + TimeDelta::seconds(21));

    // The first entry is gone; a fresh one waits out the backoff.
    let pending = backend.queue.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].email_id().unwrap(), id);
    assert_eq!(pending[0].deliveries, 0);

    assert!(!server.saw("RCPT"));
}

#[tokio::test]
async fn permanent_rejection_at_rcpt_fails() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "5.1.1 User unknown")
        .build()
        .await
        .unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;

    worker(&backend, &server, RetryPolicy::default())
        .run_once()
        .await
        .unwrap();

    let email = load(&backend, &id).await;
    assert_eq!(email.status, EmailStatus::Failed);
    assert_eq!(email.retry_count, 0);
    assert!(email.last_error.as_deref().unwrap().contains("550"));
    assert_eq!(backend.queue.depth().await.unwrap(), 0);
    assert!(!server.saw("DATA"));
}

#[tokio::test]
async fn dropped_connection_is_retried() {
    let server = MockSmtpServer::builder()
        .with_hang_up_on("MAIL")
        .build()
        .await
        .unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;

    worker(&backend, &server, RetryPolicy::default())
        .run_once()
        .await
        .unwrap();

    let email = load(&backend, &id).await;
    assert_eq!(email.status, EmailStatus::Queued);
    assert_eq!(email.retry_count, 1);
    assert_eq!(backend.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn unreachable_server_is_retried() {
    // Grab a free port, then close it again.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;

    let engine = Arc::new(DeliveryEngine::new(
        Arc::new(Loopback),
        Arc::new(Unsigned),
        Arc::new(RateLimiter::default()),
        EngineConfig {
            smtp_port: port,
            socket_timeout_ms: 2000,
            ..EngineConfig::default()
        },
    ));
    Worker::new(
        "worker-1",
        backend.stores(),
        engine,
        RetryPolicy::default(),
        WorkerConfig {
            block_ms: 50,
            ..WorkerConfig::default()
        },
    )
    .run_once()
    .await
    .unwrap();

    let email = load(&backend, &id).await;
    assert_eq!(email.status, EmailStatus::Queued);
    assert_eq!(email.retry_count, 1);
    assert!(email.last_error.is_some());
}

#[tokio::test]
async fn persistent_temporary_failures_exhaust_retries() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "4.3.0 Mailbox busy")
        .build()
        .await
        .unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;

    // No backoff, so every rescheduled entry is visible straight away.
    let worker = worker(
        &backend,
        &server,
        RetryPolicy {
            base_delay_ms: 0,
            ..RetryPolicy::default()
        },
    );

    for expected in 1..=3 {
        assert_eq!(worker.run_once().await.unwrap(), 1);
        let email = load(&backend, &id).await;
        assert_eq!(email.status, EmailStatus::Queued);
        assert_eq!(email.retry_count, expected);
    }

    assert_eq!(worker.run_once().await.unwrap(), 1);
    let email = load(&backend, &id).await;
    assert_eq!(email.status, EmailStatus::Failed);
    assert_eq!(email.retry_count, 4);
    assert_eq!(backend.queue.depth().await.unwrap(), 0);
    assert_eq!(server.connections(), 4);

    // Nothing left to pick up.
    assert_eq!(worker.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn running_worker_delivers_and_stops_on_signal() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let backend = MemoryBackend::default();
    let (stop, stopped) = watch::channel(false);

    let handle = tokio::spawn(worker(&backend, &server, RetryPolicy::default()).run(stopped));

    let id = submit(&backend).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while load(&backend, &id).await.status != EmailStatus::Sent {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("email was not delivered");

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn worker_survives_an_unavailable_store() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let backend = MemoryBackend::default();
    let id = submit(&backend).await;
    backend.set_available(false);

    let (stop, stopped) = watch::channel(false);
    let worker = Worker::new(
        "worker-1",
        backend.stores(),
        engine(&server),
        RetryPolicy::default(),
        WorkerConfig {
            block_ms: 50,
            error_pause_ms: 20,
            ..WorkerConfig::default()
        },
    );
    let handle = tokio::spawn(worker.run(stopped));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    backend.set_available(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while load(&backend, &id).await.status != EmailStatus::Sent {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("email was not delivered after the store came back");

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}
