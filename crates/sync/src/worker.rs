//! Background worker: turns triggers into sync cycles.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

use crate::connectivity::ConnectivityState;
use crate::engine::SyncEngine;

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    ConnectivityRestored,
    Foreground,
    Interval,
    Manual,
}

/// Cloneable sender the platform layer uses to poke the worker.
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<SyncTrigger>,
    engine: SyncEngine,
}

impl TriggerHandle {
    /// Report a network change. Coming back online requests a cycle.
    pub fn connectivity_changed(&self, online: bool) {
        let state = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        if self.engine.connectivity().set(state) && online {
            self.send(SyncTrigger::ConnectivityRestored);
        }
    }

    /// The application came to the foreground.
    pub fn foreground(&self) {
        self.send(SyncTrigger::Foreground);
    }

    pub fn request_sync(&self) {
        self.send(SyncTrigger::Manual);
    }

    fn send(&self, trigger: SyncTrigger) {
        // A full channel already holds a pending request.
        if let Err(err) = self.tx.try_send(trigger) {
            tracing::debug!(?trigger, error = %err, "trigger coalesced");
        }
    }
}

/// Background sync worker.
pub struct SyncWorker {
    engine: SyncEngine,
    sync_interval: Duration,
    janitor_interval: Duration,
    shutdown: Arc<Notify>,
    rx: mpsc::Receiver<SyncTrigger>,
    tx: mpsc::Sender<SyncTrigger>,
}

impl SyncWorker {
    const TRIGGER_BUFFER: usize = 8;

    pub fn new(engine: SyncEngine, sync_interval: Duration, janitor_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(Self::TRIGGER_BUFFER);
        Self {
            engine,
            sync_interval,
            janitor_interval,
            shutdown: Arc::new(Notify::new()),
            rx,
            tx,
        }
    }

    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle {
            tx: self.tx.clone(),
            engine: self.engine.clone(),
        }
    }

    /// Shared shutdown signal; `notify_one` stops the worker.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Request graceful shutdown of the worker.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Start the background loop.
    ///
    /// Every interval tick requests a cycle; while offline the tick probes the
    /// remote instead and a successful probe counts as connectivity restored.
    /// The janitor runs on its own interval. Triggers that pile up while a
    /// cycle runs collapse into one follow-up cycle.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        let Self {
            engine,
            sync_interval,
            janitor_interval,
            shutdown,
            mut rx,
            tx,
        } = self;

        tokio::spawn(async move {
            // Keep a sender alive so `recv` never reports a closed channel.
            let _tx = tx;
            tracing::info!(
                sync_interval_secs = sync_interval.as_secs(),
                janitor_interval_secs = janitor_interval.as_secs(),
                "background sync worker started"
            );

            let mut ticker = tokio::time::interval(sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut janitor = tokio::time::interval(janitor_interval);
            janitor.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Both fire immediately; the first sync tick doubles as startup sync.
            janitor.tick().await;

            loop {
                let trigger = tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("background sync worker received shutdown signal");
                        break;
                    }
                    _ = janitor.tick() => {
                        let evicted = engine.sweep().await;
                        if !evicted.is_empty() {
                            tracing::warn!(
                                evicted = evicted.len(),
                                "janitor evicted entries past the retry cap"
                            );
                        }
                        continue;
                    }
                    _ = ticker.tick() => {
                        if engine.connectivity().is_online() {
                            SyncTrigger::Interval
                        } else if engine.remote().probe().await {
                            engine.connectivity().set_online();
                            tracing::info!("remote reachable again");
                            SyncTrigger::ConnectivityRestored
                        } else {
                            tracing::debug!("skipping sync - offline");
                            continue;
                        }
                    }
                    Some(trigger) = rx.recv() => trigger,
                };

                let mut coalesced = 0usize;
                while rx.try_recv().is_ok() {
                    coalesced += 1;
                }

                run(&engine, trigger, coalesced).await;
            }

            tracing::info!("background sync worker stopped");
        })
    }
}

async fn run(engine: &SyncEngine, trigger: SyncTrigger, coalesced: usize) {
    if !engine.connectivity().is_online() {
        tracing::debug!(?trigger, "skipping sync - offline");
        return;
    }

    tracing::debug!(?trigger, coalesced, "sync requested");
    match engine.sync().await {
        Ok(report) if report.is_clean() => {
            tracing::debug!(?trigger, "sync completed");
        }
        Ok(report) => {
            tracing::warn!(
                ?trigger,
                failed = report.failed,
                evicted = report.evicted.len(),
                errors = report.errors.len(),
                aborted = report.aborted,
                "sync completed with problems"
            );
        }
        Err(err) => {
            tracing::error!(?trigger, error = %err, "sync failed");
        }
    }
}
