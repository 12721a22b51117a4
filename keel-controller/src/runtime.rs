//! The async runtime of a controller.
//!
//! The pipeline is synchronous and touches the store, so every event is handled on a blocking
//! thread. Events are handled strictly one after another: the controller is moved onto the
//! blocking thread for the handling of an event and moved back once it is done.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::config::Config;
use crate::controller::{Controller, DispatchOutcome};
use crate::event::{ChangeCategory, ChangeEvent};
use crate::store::{MemoryStore, StoreChange};
use crate::watch::ChangeListener;

/// A unit of work for the controller worker.
#[derive(Debug)]
enum Job {
    /// Arm all watches and run the first pipelines.
    Init,
    /// A store notification.
    Change(StoreChange),
    /// The periodic rebalance timer fired.
    Periodic,
    /// Notifications were lost; re-arm all watches and run everything.
    Resync,
    /// Tear down all watches.
    Finalize,
}

/// The controller along with its change listener, moved between the task and blocking threads.
struct Worker {
    controller: Controller,
    listener: ChangeListener,
}

impl Worker {
    fn run(&mut self, job: Job) -> Option<DispatchOutcome> {
        let event = match job {
            Job::Init => match self.listener.init() {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(error = ?err, "error arming watches, running initial pipelines regardless");
                    ChangeEvent::callback(ChangeCategory::Controller)
                }
            },
            Job::Change(change) => self.listener.on_change(&change)?,
            Job::Periodic => {
                self.resync();
                ChangeEvent::periodic()
            }
            Job::Resync => {
                self.resync();
                ChangeEvent::callback(ChangeCategory::Controller)
            }
            Job::Finalize => self.listener.finalize(),
        };
        Some(self.controller.handle(&event))
    }

    fn resync(&mut self) {
        if let Err(err) = self.listener.resync() {
            tracing::error!(error = ?err, "error re-arming watches");
        }
    }
}

/// A task driving a controller from store notifications and the periodic rebalance timer.
pub struct ControllerTask {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The worker, absent only while it is handling a job.
    worker: Option<Worker>,

    /// Store change notifications.
    changes: BroadcastStream<StoreChange>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A signal of the number of events handled so far.
    handled_tx: watch::Sender<u64>,
    handled: u64,
}

impl ControllerTask {
    /// Create a new instance.
    ///
    /// Returns the task along with a signal of the number of events it handled.
    pub fn new(
        config: Arc<Config>, controller: Controller, listener: ChangeListener, changes: broadcast::Receiver<StoreChange>, shutdown: broadcast::Receiver<()>,
    ) -> (Self, watch::Receiver<u64>) {
        let (handled_tx, handled_rx) = watch::channel(0);
        (
            Self {
                config,
                worker: Some(Worker { controller, listener }),
                changes: BroadcastStream::new(changes),
                shutdown_rx: BroadcastStream::new(shutdown),
                handled_tx,
                handled: 0,
            },
            handled_rx,
        )
    }

    /// Create a new instance running the standard pipelines against the given memory store.
    pub fn for_memory_store(config: Arc<Config>, store: Arc<MemoryStore>, shutdown: broadcast::Receiver<()>) -> Result<(Self, watch::Receiver<u64>)> {
        // Subscribe before any watch is armed so that no notification is missed.
        let changes = store.subscribe();
        let controller = Controller::with_standard_pipelines(config.clone(), store.clone()).context("error building controller pipelines")?;
        let listener = ChangeListener::new(controller.keys().clone(), store.clone(), store, config.store_retry_attempts);
        Ok(Self::new(config, controller, listener, changes, shutdown))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.config.cluster_name, controller = %self.config.controller_id))]
    async fn run(mut self) -> Result<()> {
        tracing::debug!("controller task started");
        let mut ticker: BoxStream<'static, ()> = match self.config.rebalance_interval() {
            Some(period) => IntervalStream::new(interval_at(Instant::now() + period, period)).map(|_| ()).boxed(),
            None => stream::pending().boxed(),
        };

        self.dispatch(Job::Init).await?;
        loop {
            tokio::select! {
                Some(change) = self.changes.next() => match change {
                    Ok(change) => self.dispatch(Job::Change(change)).await?,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "store notifications lagged, resyncing");
                        self.dispatch(Job::Resync).await?;
                    }
                },
                Some(_) = ticker.next() => self.dispatch(Job::Periodic).await?,
                _ = self.shutdown_rx.next() => break,
            }
        }

        self.dispatch(Job::Finalize).await?;
        tracing::debug!("controller task shutdown");
        Ok(())
    }

    /// Handle a job on a blocking thread.
    async fn dispatch(&mut self, job: Job) -> Result<()> {
        let mut worker = self.worker.take().context("controller worker is not available")?;
        let (worker, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = worker.run(job);
            (worker, outcome)
        })
        .await
        .context("error joining controller worker")?;
        self.worker = Some(worker);

        if let Some(outcome) = outcome {
            tracing::trace!(?outcome, "event handled");
            self.handled += 1;
            let _ = self.handled_tx.send(self.handled);
        }
        Ok(())
    }
}
