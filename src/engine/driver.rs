//! Periodic driver: runs [`Engine::tick`] on a tokio interval until told to stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::orchestrator::Engine;

/// Handle to a running driver loop.
pub struct DriverHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl DriverHandle {
    /// Completed ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Signal the loop to stop after the tick in progress. Safe to call twice.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Shut down and wait for the loop to exit.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::error!("Engine driver task failed: {e}");
            }
        }
    }
}

/// Spawn the tick loop. Each tick runs on the blocking pool so store I/O
/// never stalls the runtime; a slow tick delays the next one instead of
/// queuing a burst.
pub fn spawn_driver(engine: Arc<Engine>, period: Duration) -> DriverHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let ticks = Arc::new(AtomicU64::new(0));
    let counter = ticks.clone();

    let join = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Engine driver stopped");
                    break;
                }
                _ = interval.tick() => {
                    let engine = engine.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let now = engine.now();
                        engine.tick(now)
                    })
                    .await;
                    match result {
                        Ok(report) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            if report.failures > 0 {
                                tracing::warn!(failures = report.failures, "Tick finished with failures");
                            }
                        }
                        Err(e) => tracing::error!("Tick panicked: {e}"),
                    }
                }
            }
        }
    });

    tracing::info!(period_ms = period.as_millis() as u64, "Engine driver started");

    DriverHandle {
        shutdown_tx: Some(shutdown_tx),
        join: Some(join),
        ticks,
    }
}
