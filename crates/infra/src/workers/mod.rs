//! Polling worker drivers, one per queue.
//!
//! - `run_next` processes at most one unit of work and returns its id, or
//!   `None` when the queue was empty
//! - `run` polls until shutdown is signalled (or the queue drains, if
//!   configured), sleeping `poll_interval` plus random jitter between empty polls
//! - collaborator failures and panics are recorded on the row; nothing is retried here

pub mod export;
pub mod scim;
pub mod slack;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, trace};

use crate::store::StoreResult;

pub use export::{ExportProcessor, ExportWorker};
pub use scim::{DirectorySynchronizer, ScimSyncWorker};
pub use slack::{PostedMessage, SlackRelayWorker, SlackSender};

/// Polling cadence of a worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each sleep.
    pub jitter: Duration,
    pub shutdown_when_queue_empty: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            jitter: Duration::from_millis(100),
            shutdown_when_queue_empty: false,
        }
    }
}

impl PollConfig {
    /// Sleep duration with random jitter applied.
    pub fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }
}

/// A queue driver that can be polled.
#[async_trait::async_trait]
pub trait PollingWorker: Send + Sync {
    type Id: fmt::Display + Send;

    fn name(&self) -> &'static str;

    fn poll_config(&self) -> &PollConfig;

    /// Process the next unit of work, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(id))` if work was done
    /// - `Ok(None)` if the queue was empty
    /// - `Err(...)` if the store failed
    async fn run_next(&self) -> StoreResult<Option<Self::Id>>;

    /// Poll until `shutdown` carries `true` or its sender is dropped.
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let worker = self.name();
        loop {
            if *shutdown.borrow() {
                debug!(worker, "shutdown requested, stopping worker");
                break;
            }

            let sleep_duration = match self.run_next().await {
                Ok(Some(id)) => {
                    trace!(worker, %id, "processed");
                    continue;
                }
                Ok(None) if self.poll_config().shutdown_when_queue_empty => {
                    debug!(worker, "queue empty, shutting down the worker");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.poll_config().sleep_duration_with_jitter();
                    trace!(worker, ?sleep_duration, "queue empty, polling again later");
                    sleep_duration
                }
                Err(err) => {
                    error!(worker, error = %err, "worker iteration failed");
                    self.poll_config().sleep_duration_with_jitter()
                }
            };

            tokio::select! {
                _ = sleep(sleep_duration) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!(worker, "shutdown channel closed, stopping worker");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to stop and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Run `worker` on the current tokio runtime.
    pub fn spawn<W>(worker: W) -> Self
    where
        W: PollingWorker + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        let join = tokio::spawn(async move { worker.run(receiver).await });
        Self { shutdown, join }
    }

    /// Request graceful shutdown and wait for the current iteration to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "worker task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Await a collaborator call, turning errors and panics into a recordable message.
pub(crate) async fn catch_failure<F, T>(future: F) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(panic_message(&*panic)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
