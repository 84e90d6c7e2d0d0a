use crate::core::{chain::RegistryFetcher, error::IndexerError, reconciler::Reconciler};
use keymirror_common::block::BlockRef;
use metrics::{counter, gauge};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    select,
    sync::Mutex,
    task::{JoinError, JoinHandle},
    time::{self, Instant},
};

// Updater must be behind an Arc to be reachable from the daemon (to stop
// it) and from its own tokio task
pub type SharedUpdater<F> = Arc<Updater<F>>;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("update loop is already running")]
    AlreadyRunning,
    #[error("update loop is not running")]
    NotRunning,
    #[error(transparent)]
    TaskError(#[from] JoinError),
}

// Periodic driver of the reconciliation engine. One cycle reconciles
// every tracked module against the finalized block, cycles never overlap,
// and a long stretch without a successful cycle is treated as fatal:
// the process exits and the supervisor is expected to restart it.
pub struct Updater<F: RegistryFetcher> {
    // tokio task
    task: Mutex<Option<JoinHandle<()>>>,
    // single-flight guard, a trigger arriving while a cycle runs is
    // dropped rather than queued
    running: Mutex<()>,
    reconcilers: Vec<Reconciler<F>>,
    interval: Duration,
    timeout: Duration,
    // block number of the last committed snapshot, for the watchdog log
    last_block: AtomicU64,
}

impl<F: RegistryFetcher + 'static> Updater<F> {
    pub fn new(
        reconcilers: Vec<Reconciler<F>>,
        interval: Duration,
        timeout: Duration,
    ) -> SharedUpdater<F> {
        Arc::new(Self {
            task: Mutex::new(None),
            running: Mutex::new(()),
            reconcilers,
            interval,
            timeout,
            last_block: AtomicU64::new(0),
        })
    }

    // Start the periodic loop, the first cycle runs immediately
    pub async fn start(self: &Arc<Self>) -> Result<(), UpdaterError> {
        trace!("Starting update loop");

        if self.is_running().await {
            return Err(UpdaterError::AlreadyRunning);
        }

        let zelf = Arc::clone(self);
        *self.task.lock().await = Some(tokio::spawn(async move {
            zelf.run().await;
        }));

        Ok(())
    }

    // Stop the internal loop
    pub async fn stop(&self) -> Result<(), UpdaterError> {
        trace!("Stopping update loop");

        if let Some(handle) = self.task.lock().await.take() {
            if handle.is_finished() {
                handle.await?;
            } else {
                handle.abort();
            }
            return Ok(());
        }

        Err(UpdaterError::NotRunning)
    }

    pub async fn is_running(&self) -> bool {
        let task = self.task.lock().await;
        task.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        // the deadline is only pushed forward by a successful cycle, so a
        // hung RPC or a persistently failing chain endpoint also trips it
        let mut deadline = Instant::now() + self.timeout;
        loop {
            select! {
                biased;
                _ = time::sleep_until(deadline) => {
                    error!(
                        "No successful registry update within {:?}, last mirrored block #{}; exiting",
                        self.timeout,
                        self.last_block.load(Ordering::SeqCst)
                    );
                    std::process::exit(1);
                }
                result = async { ticker.tick().await; self.run_cycle().await } => {
                    match result {
                        Ok(true) => {
                            deadline = Instant::now() + self.timeout;
                        }
                        // the trigger was dropped by the single-flight guard
                        Ok(false) => {}
                        Err(e) => {
                            counter!("keymirror_update_failures").increment(1);
                            error!("Registry update cycle failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    // Run one update cycle over all tracked modules. Returns false when a
    // cycle is already in flight and this trigger was dropped.
    pub async fn run_cycle(&self) -> Result<bool, IndexerError> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Update cycle already in progress, dropping trigger");
            return Ok(false);
        };

        for reconciler in &self.reconcilers {
            let module = *reconciler.module();
            if let Some(meta) = reconciler.update(&BlockRef::Finalized).await? {
                self.last_block.store(meta.block_number, Ordering::SeqCst);
                gauge!("keymirror_last_block_number", "module" => module.to_hex())
                    .set(meta.block_number as f64);
                gauge!("keymirror_last_block_timestamp", "module" => module.to_hex())
                    .set(meta.timestamp as f64);
            }
        }

        counter!("keymirror_update_cycles").increment(1);
        Ok(true)
    }
}
