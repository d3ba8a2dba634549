//! Daemon lifecycle: bring-up, the mining pipeline, signal handling and
//! shutdown.
//!
//! ```text
//!  pool --Notification--> feed_chain --Work--> Chain
//!   ^                                            |
//!   +--ValidatedWork-- forward_results <--MinedWork
//! ```
//!
//! Every pipeline task ends the daemon when it ends, so a failure anywhere
//! shuts everything down rather than leaving a half-working miner.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::asic::bm1380::{Chain, ChainEvent};
use crate::config::MinerConfig;
use crate::job_generator::{JobError, JobGenerator};
use crate::stratum_v1::StratumV1Client;
use crate::tracing::prelude::*;
use crate::types::{MinedWork, Notification, ValidatedWork, Work};
use crate::validator::validate;

/// Pool notifications waiting for the job feeder.
const NOTIFICATION_QUEUE: usize = 8;

/// Validated shares waiting for submission.
const SUBMISSION_QUEUE: usize = 64;

/// The main daemon.
pub struct Daemon {
    config: MinerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(MinerConfig::from_env()?))
    }

    /// Spawn a pipeline task that shuts the daemon down when it ends.
    fn spawn<F>(&self, name: &'static str, task: F) -> JoinHandle<anyhow::Result<()>>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => debug!(task = name, "Task finished"),
                Err(e) => error!(task = name, error = %e, "Task failed"),
            }
            shutdown.cancel();
            result
        })
    }

    /// Run the daemon until a signal arrives or the pipeline fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut chain = Chain::open(&self.config.chain)
            .await
            .with_context(|| format!("Failed to bring up chain on {}", self.config.chain.port))?;
        info!(
            chips = chain.chain_length(),
            hashrate = %chain.hash_rate(),
            timeout_ms = chain.timeout().as_millis() as u64,
            "Chain ready"
        );
        let results = chain
            .take_results()
            .ok_or_else(|| anyhow!("chain results already taken"))?;
        let chain_events = chain.subscribe_events();
        let chain = Arc::new(chain);

        let client = StratumV1Client::connect(self.config.pool.clone())
            .await
            .with_context(|| format!("Failed to connect to pool {}", self.config.pool.url))?;

        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_QUEUE);
        let (submission_tx, submission_rx) = mpsc::channel(SUBMISSION_QUEUE);

        let mut tasks = Vec::new();
        tasks.push(self.spawn("stratum", {
            let shutdown = self.shutdown.clone();
            async move {
                client
                    .run(notification_tx, submission_rx, shutdown)
                    .await
                    .context("Pool session ended")
            }
        }));
        tasks.push(self.spawn(
            "feeder",
            feed_chain(Arc::clone(&chain), notification_rx, self.shutdown.clone()),
        ));
        tasks.push(self.spawn(
            "results",
            forward_results(results, submission_tx, self.shutdown.clone()),
        ));
        tasks.push(self.spawn(
            "chain-monitor",
            monitor_chain(chain_events, self.shutdown.clone()),
        ));
        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=bm1380_miner=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT."),
            _ = sigterm.recv() => info!("Received SIGTERM."),
            _ = self.shutdown.cancelled() => info!("Pipeline stopped."),
        }

        self.shutdown.cancel();
        self.tracker.wait().await;

        let discarded = chain.flush();
        debug!(discarded, "Dropped queued jobs");
        if !chain.is_open() {
            debug!("Chain already closed");
        } else if let Err(e) = chain.close().await {
            warn!(error = %e, "Error closing chain");
        }

        let mut outcome = Ok(());
        for task in tasks {
            if let Err(e) = task.await? {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        info!("Exiting.");
        outcome
    }
}

/// Keep the chain supplied with jobs from the latest notification.
///
/// A notification with clean-jobs set flushes whatever the chain still had
/// queued.
async fn feed_chain(
    chain: Arc<Chain>,
    mut notifications: mpsc::Receiver<Notification>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut generator = JobGenerator::new();

    loop {
        let notification = match next_work(&mut generator)? {
            Some(work) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    notification = notifications.recv() => notification,
                    submitted = chain.submit(work) => {
                        submitted?;
                        continue;
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    notification = notifications.recv() => notification,
                }
            }
        };

        let Some(notification) = notification else {
            debug!("Notification channel closed");
            return Ok(());
        };
        info!(
            job_id = %notification.job_id,
            difficulty = %notification.difficulty,
            "New work from pool"
        );
        if generator.update(Arc::new(notification)) {
            chain.flush();
        }
    }
}

/// The next job to send, or `None` before the first notification.
///
/// Running out of extranonce2 values is fatal.
fn next_work(generator: &mut JobGenerator) -> Result<Option<Work>, JobError> {
    match generator.next_job() {
        Ok(job) => Ok(generator.notification().map(|notification| Work {
            notification: Arc::clone(notification),
            job,
        })),
        Err(JobError::NoNotification) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Validate mined work and pass shares on to the pool.
async fn forward_results(
    mut results: mpsc::Receiver<MinedWork>,
    submissions: mpsc::Sender<ValidatedWork>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let mined = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            mined = results.recv() => mined,
        };
        let Some(mined) = mined else {
            return Err(anyhow!("chain stopped producing results"));
        };

        trace!(
            job_id = %mined.notification.job_id,
            nonces = mined.result.nonces().len(),
            "Mined work"
        );
        if let Some(validated) = validate(mined) {
            if submissions.send(validated).await.is_err() {
                debug!("Submission channel closed");
                return Ok(());
            }
        }
    }
}

/// Log chain lifecycle events; a closed chain ends the daemon.
async fn monitor_chain(
    mut events: broadcast::Receiver<ChainEvent>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Ok(ChainEvent::Started) => debug!("Chain busy"),
            Ok(ChainEvent::Stopped) => debug!("Chain idle"),
            Ok(ChainEvent::Error(e)) => error!(error = %e, "Chain error"),
            Ok(ChainEvent::Closed) => return Err(anyhow!("chain closed")),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Missed chain events");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
