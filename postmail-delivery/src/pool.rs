//! Worker pool
//!
//! The [`PoolManager`] keeps between `min_workers` and `max_workers` workers
//! running, sampling the queue depth on a fixed interval to decide whether to
//! grow or shrink. Workers that die are replaced after a delay.

use std::{any::Any, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use postmail_common::{Signal, internal};
use postmail_store::{Connector, Queue, StoreError};
use serde::Deserialize;
use tokio::{
    sync::{broadcast, watch},
    task::{AbortHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::{Deliverer, RetryPolicy, Worker, WorkerConfig, WorkerError};

const fn default_min_workers() -> usize {
    2
}

const fn default_max_workers() -> usize {
    10
}

const fn default_queue_threshold_high() -> usize {
    100
}

const fn default_queue_threshold_low() -> usize {
    10
}

const fn default_check_interval_ms() -> u64 {
    30_000
}

const fn default_respawn_delay_ms() -> u64 {
    5000
}

const fn default_shutdown_notice_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Workers kept running at all times (default: 2)
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound on running workers (default: 10)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Queue depth above which workers are added (default: 100)
    #[serde(default = "default_queue_threshold_high")]
    pub queue_threshold_high: usize,

    /// Queue depth below which workers are retired (default: 10)
    #[serde(default = "default_queue_threshold_low")]
    pub queue_threshold_low: usize,

    /// How often the queue depth is sampled, in milliseconds (default: 30000)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Wait before replacing a crashed worker, in milliseconds (default: 5000)
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,

    /// While shutting down, how often to report workers still finishing an
    /// in-flight delivery (default: 30). Shutdown never aborts a worker.
    #[serde(default = "default_shutdown_notice_secs")]
    pub shutdown_notice_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            queue_threshold_high: default_queue_threshold_high(),
            queue_threshold_low: default_queue_threshold_low(),
            check_interval_ms: default_check_interval_ms(),
            respawn_delay_ms: default_respawn_delay_ms(),
            shutdown_notice_secs: default_shutdown_notice_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Spawn this many workers.
    Up(usize),
    /// Retire this many workers.
    Down(usize),
    Hold,
}

/// Decide how to resize a pool of `current` workers given the queue `depth`.
///
/// A pool below `min_workers` is always topped up first.
#[must_use]
pub fn scaling_decision(depth: usize, current: usize, config: &PoolConfig) -> ScaleDecision {
    if current < config.min_workers {
        return ScaleDecision::Up(config.min_workers - current);
    }

    if depth > config.queue_threshold_high && current < config.max_workers {
        let wanted = depth.div_ceil(config.queue_threshold_high.max(1));
        return ScaleDecision::Up(wanted.min(config.max_workers - current));
    }

    if depth < config.queue_threshold_low && current > config.min_workers {
        let surplus = current - config.min_workers;
        return ScaleDecision::Down(surplus.div_ceil(2).min(surplus));
    }

    ScaleDecision::Hold
}

/// Runs one worker to completion.
///
/// `Ok` means the worker stopped because it was asked to.
#[async_trait]
pub trait WorkerFactory: Send + Sync + Debug {
    async fn run(&self, id: String, stop: watch::Receiver<bool>) -> Result<(), WorkerError>;
}

/// Connects to the stores and runs a delivery [`Worker`] on them.
#[derive(Debug)]
pub struct DeliveryWorkerFactory {
    connector: Arc<dyn Connector>,
    deliverer: Arc<dyn Deliverer>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl DeliveryWorkerFactory {
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        deliverer: Arc<dyn Deliverer>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            connector,
            deliverer,
            policy,
            config,
        }
    }
}

#[async_trait]
impl WorkerFactory for DeliveryWorkerFactory {
    async fn run(&self, id: String, stop: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let stores = self.connector.connect().await.map_err(WorkerError::Connect)?;

        Worker::new(
            id,
            stores,
            Arc::clone(&self.deliverer),
            self.policy.clone(),
            self.config.clone(),
        )
        .run(stop)
        .await;

        Ok(())
    }
}

#[derive(Debug)]
struct WorkerHandle {
    id: String,
    stop: watch::Sender<bool>,
}

#[derive(Debug)]
struct WorkerExit {
    id: String,
    result: Result<(), WorkerError>,
}

/// Aborts the worker task if its supervising task is dropped, which only
/// happens when the [`PoolManager`] itself is dropped without shutting down.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[derive(Debug)]
pub struct PoolManager {
    config: PoolConfig,
    factory: Arc<dyn WorkerFactory>,
    queue: Arc<dyn Queue>,
    /// Workers not asked to stop, oldest first.
    workers: Vec<WorkerHandle>,
    /// Every supervised task, including workers that are winding down.
    tasks: JoinSet<WorkerExit>,
    respawns: JoinSet<()>,
    next_id: u64,
}

impl PoolManager {
    /// `queue` is only used to sample the depth; workers open their own
    /// connections through `factory`.
    #[must_use]
    pub fn new(config: PoolConfig, factory: Arc<dyn WorkerFactory>, queue: Arc<dyn Queue>) -> Self {
        Self {
            config,
            factory,
            queue,
            workers: Vec::new(),
            tasks: JoinSet::new(),
            respawns: JoinSet::new(),
            next_id: 0,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of workers that have not been asked to stop.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Ids of the active workers, oldest first.
    #[must_use]
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|worker| worker.id.clone()).collect()
    }

    /// Bring the pool up to `min_workers`.
    pub fn start(&mut self) {
        while self.workers.len() < self.config.min_workers {
            self.spawn_worker();
        }
    }

    /// Sample the queue depth once and resize the pool accordingly.
    ///
    /// # Errors
    ///
    /// Returns the store error if the depth could not be read; the pool is
    /// left unchanged.
    pub async fn rebalance(&mut self) -> Result<ScaleDecision, StoreError> {
        let depth = self.queue.depth().await?;
        let decision = scaling_decision(depth, self.workers.len(), &self.config);

        match decision {
            ScaleDecision::Up(count) => {
                info!(depth, count, active = self.workers.len(), "Scaling workers up");
                for _ in 0..count {
                    self.spawn_worker();
                }
            }
            ScaleDecision::Down(count) => {
                info!(depth, count, active = self.workers.len(), "Scaling workers down");
                for _ in 0..count {
                    self.retire_newest();
                }
            }
            ScaleDecision::Hold => {
                debug!(depth, active = self.workers.len(), "Worker pool unchanged");
            }
        }

        Ok(decision)
    }

    /// Run the pool until a shutdown signal arrives, then stop every worker.
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, "Worker pool starting");
        self.start();

        let mut timer =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(err) = self.rebalance().await {
                        error!(error = %err, "Could not read queue depth");
                    }
                }
                Some(exit) = self.tasks.join_next() => {
                    match exit {
                        Ok(exit) => self.on_exit(exit),
                        Err(err) => error!(error = %err, "Worker supervisor failed"),
                    }
                }
                Some(_) = self.respawns.join_next() => {
                    self.respawn();
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Worker pool received shutdown signal");
                        }
                        Err(err) => {
                            error!("Worker pool shutdown channel error: {err}");
                        }
                    }
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    /// Ask every worker to stop and wait until all of them have exited.
    ///
    /// Workers finish their current iteration, so an in-flight delivery runs
    /// to completion (bounded by its socket timeouts).
    pub async fn shutdown(mut self) {
        self.respawns.abort_all();
        for worker in self.workers.drain(..) {
            let _ = worker.stop.send(true);
        }

        let notice = Duration::from_secs(self.config.shutdown_notice_secs.max(1));
        loop {
            match tokio::time::timeout(notice, self.tasks.join_next()).await {
                Ok(Some(Ok(WorkerExit { id, result: Err(err) }))) => {
                    warn!(worker = %id, error = %err, "Worker failed while stopping");
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(err))) => error!(error = %err, "Worker supervisor failed"),
                Ok(None) => break,
                Err(_) => warn!(
                    remaining = self.tasks.len(),
                    "Still waiting for workers to finish in-flight deliveries"
                ),
            }
        }

        internal!(level = INFO, "Worker pool stopped");
    }

    fn spawn_worker(&mut self) {
        self.next_id += 1;
        let id = format!("worker-{}", self.next_id);
        let (stop, stopped) = watch::channel(false);

        let factory = Arc::clone(&self.factory);
        let worker_id = id.clone();
        let worker = tokio::spawn(async move { factory.run(worker_id, stopped).await });
        let guard = AbortOnDrop(worker.abort_handle());

        let exit_id = id.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let result = match worker.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(WorkerError::Panicked(panic_message(err.into_panic().as_ref())))
                }
                Err(_) => Err(WorkerError::Cancelled),
            };
            WorkerExit { id: exit_id, result }
        });

        debug!(worker = %id, "Spawned worker");
        self.workers.push(WorkerHandle { id, stop });
    }

    fn retire_newest(&mut self) {
        if let Some(worker) = self.workers.pop() {
            debug!(worker = %worker.id, "Stopping worker");
            let _ = worker.stop.send(true);
        }
    }

    fn on_exit(&mut self, exit: WorkerExit) {
        let position = self.workers.iter().position(|worker| worker.id == exit.id);
        let was_active = position.is_some();
        if let Some(position) = position {
            self.workers.remove(position);
        }

        match exit.result {
            Ok(()) => debug!(worker = %exit.id, "Worker exited"),
            Err(err) => {
                error!(worker = %exit.id, error = %err, "Worker died");
                if was_active && self.workers.len() < self.config.max_workers {
                    let delay = Duration::from_millis(self.config.respawn_delay_ms);
                    self.respawns.spawn(tokio::time::sleep(delay));
                }
            }
        }
    }

    fn respawn(&mut self) {
        if self.workers.len() < self.config.max_workers {
            info!(active = self.workers.len(), "Replacing dead worker");
            self.spawn_worker();
        }
    }
}
