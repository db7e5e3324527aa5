//! Worker pool that polls for work, reports a heartbeat and shuts down
//! gracefully.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::worker::Worker;
use super::RunnerError;
use crate::store::{ProcessIdentity, Store};

/// Hosts N workers sharing one stop flag.
pub struct Runner {
    label: String,
    store: Arc<dyn Store>,
    identity: ProcessIdentity,
    workers: Vec<Arc<dyn Worker>>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    shutdown_timeout: Duration,
}

impl Runner {
    pub fn builder(
        label: impl Into<String>,
        store: Arc<dyn Store>,
        identity: ProcessIdentity,
    ) -> RunnerBuilder {
        RunnerBuilder::new(label, store, identity)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run on a background task; stop it through the returned handle.
    pub fn start(self) -> RunnerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        RunnerHandle {
            shutdown_tx,
            handle,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Workers finish their current unit of work; those still busy after the
    /// graceful timeout are aborted and their claims released.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunnerError> {
        self.store.beat(&self.identity).await?;
        info!(
            runner = %self.label,
            process = %self.identity,
            workers = self.workers.len(),
            "runner started"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            tasks.spawn(worker_loop(worker.clone(), self.poll_interval, stop_rx.clone()));
        }

        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.store.beat(&self.identity).await {
                        warn!(runner = %self.label, error = %e, "heartbeat failed");
                    }
                    while let Some(joined) = tasks.try_join_next() {
                        if let Err(e) = joined {
                            error!(runner = %self.label, error = %e, "worker task died");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(runner = %self.label, "runner stopping");
        let _ = stop_tx.send(true);

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(runner = %self.label, error = %e, "worker task died");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                runner = %self.label,
                remaining = tasks.len(),
                "workers did not stop in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}

            match self.store.release_claims(&self.identity).await {
                Ok(released) => info!(runner = %self.label, released, "released abandoned claims"),
                Err(e) => error!(runner = %self.label, error = %e, "failed to release claims"),
            }
        }

        self.store.remove_heartbeat(&self.identity).await?;
        info!(runner = %self.label, "runner stopped");
        Ok(())
    }
}

async fn worker_loop(worker: Arc<dyn Worker>, poll_interval: Duration, mut stop: watch::Receiver<bool>) {
    let label = worker.label();
    debug!(worker = %label, "worker started");

    while !*stop.borrow() {
        let found = match worker.work_once().await {
            Ok(found) => found,
            Err(e) => {
                error!(worker = %label, error = %e, "work unit failed");
                false
            }
        };
        if !found {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    debug!(worker = %label, "worker stopped");
}

/// Handle to a runner started with [`Runner::start`].
pub struct RunnerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), RunnerError>>,
}

impl RunnerHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Request shutdown and wait for the runner to finish.
    pub async fn shutdown(self) -> Result<(), RunnerError> {
        self.trigger_shutdown();
        self.handle.await?
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder {
    label: String,
    store: Arc<dyn Store>,
    identity: ProcessIdentity,
    workers: Vec<Arc<dyn Worker>>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    shutdown_timeout: Duration,
}

impl RunnerBuilder {
    /// Create a new builder with the given store.
    pub fn new(label: impl Into<String>, store: Arc<dyn Store>, identity: ProcessIdentity) -> Self {
        Self {
            label: label.into(),
            store,
            identity,
            workers: Vec::new(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Add one worker.
    pub fn worker(mut self, worker: impl Worker) -> Self {
        self.workers.push(Arc::new(worker));
        self
    }

    /// Add `count` copies of a cloneable worker.
    pub fn workers<W: Worker + Clone>(mut self, worker: W, count: usize) -> Self {
        for _ in 0..count {
            self.workers.push(Arc::new(worker.clone()));
        }
        self
    }

    /// Set the idle sleep between claim attempts.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set how long workers get to finish before being aborted.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runner.
    pub fn build(self) -> Runner {
        Runner {
            label: self.label,
            store: self.store,
            identity: self.identity,
            workers: self.workers,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}
