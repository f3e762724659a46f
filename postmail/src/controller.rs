use std::sync::Arc;

use postmail_common::{Signal, internal};
use postmail_delivery::{
    DeliveryEngine, DeliveryWorkerFactory, DkimSigner, DnsResolver, Intake, PoolManager,
    RateLimiter, Signer, Unsigned,
};
use postmail_store::MemoryBackend;
use tokio::sync::broadcast;

use crate::config::Config;

/// Wait for CTRL+C or SIGTERM, then tell every service to shut down.
async fn shutdown(broadcast: &broadcast::Sender<Signal>) -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    broadcast
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// Owns the configuration and the stores, and wires the delivery pipeline
/// together.
///
/// The stores are in-process, so work only reaches the pool through
/// [`Postmail::intake`]. The `postmail` binary has no inbound surface of its
/// own and delivers nothing unless an embedder submits through that handle.
#[derive(Debug)]
pub struct Postmail {
    config: Config,
    backend: Arc<MemoryBackend>,
}

impl Postmail {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let backend = Arc::new(MemoryBackend::new(&config.queue()));
        Self { config, backend }
    }

    /// A handle that records and queues emails for this instance's workers.
    /// It stays usable while [`Postmail::run`] is serving.
    #[must_use]
    pub fn intake(&self) -> Intake {
        Intake::new(self.backend.stores())
    }

    fn signer(&self) -> anyhow::Result<Arc<dyn Signer>> {
        match &self.config.dkim {
            Some(dkim) => {
                let signer = DkimSigner::new(
                    dkim.private_key.as_str(),
                    dkim.domain.as_str(),
                    dkim.selector.as_str(),
                )?;
                internal!(
                    level = INFO,
                    domain = %dkim.domain,
                    selector = %dkim.selector,
                    "DKIM signing enabled"
                );
                Ok(Arc::new(signer))
            }
            None => {
                tracing::warn!("No DKIM key configured, messages will be sent unsigned");
                Ok(Arc::new(Unsigned))
            }
        }
    }

    /// Run the worker pool until the process is told to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver or signer can't be built, or the
    /// signal handlers can't be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        internal!(level = INFO, "Controller running");

        if self.config.engine.accept_invalid_certs {
            tracing::warn!(
                "TLS certificate validation is DISABLED; upgraded connections can be intercepted"
            );
        }

        let backend = Arc::clone(&self.backend);
        let resolver = Arc::new(DnsResolver::new(self.config.dns.clone())?);
        let engine = Arc::new(DeliveryEngine::new(
            resolver,
            self.signer()?,
            Arc::new(RateLimiter::new(self.config.rate_limit.clone())),
            self.config.engine.clone(),
        ));

        let factory = Arc::new(DeliveryWorkerFactory::new(
            backend.clone(),
            engine,
            self.config.retry.clone(),
            self.config.worker.clone(),
        ));
        let pool = PoolManager::new(
            self.config.pool.clone(),
            factory,
            Arc::new(backend.queue.clone()),
        );

        let (signals, receiver) = broadcast::channel(64);
        let pool = tokio::spawn(pool.serve(receiver));

        let ret = shutdown(&signals).await;

        internal!(level = INFO, "Shutting down...");
        pool.await?;

        ret
    }
}
