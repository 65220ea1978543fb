//! Background adjustment loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::PerformanceOptimizer;
use super::resources::ResourceSampler;

/// Handle to a running monitor. Dropping it without [`stop`](Self::stop)
/// leaves the task running until the runtime shuts down.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the loop to exit and waits for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            debug!(%error, "optimizer monitor ended abnormally");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(super) fn spawn(optimizer: Arc<PerformanceOptimizer>, sampler: Arc<dyn ResourceSampler>) -> MonitorHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let period = optimizer.config().adjustment_interval();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    optimizer.run_adjustment_cycle(sampler.as_ref());
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("optimizer monitor stopped");
    });

    MonitorHandle { shutdown, task }
}
