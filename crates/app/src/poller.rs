use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

use crate::registry::TriggerRegistry;
use crate::trigger::TriggerService;

/// Counts of one polling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub queued: usize,
    pub idle: usize,
    pub failed: usize,
}

/// Background worker that turns pending notifications into queued builds.
#[derive(Clone)]
pub struct PollWorker {
    registry: TriggerRegistry,
    service: TriggerService,
    interval: Duration,
}

impl PollWorker {
    pub fn new(registry: TriggerRegistry, service: TriggerService, interval: Duration) -> Self {
        Self {
            registry,
            service,
            interval,
        }
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let summary = self.run_once().await;
            debug!(
                stage = "poller",
                queued = summary.queued,
                idle = summary.idle,
                failed = summary.failed,
                "poll cycle completed"
            );
        }
    }

    /// Drains every trigger once. A failing trigger does not stop the others.
    pub async fn run_once(&self) -> PollSummary {
        let mut summary = PollSummary::default();
        for entry in self.registry.entries() {
            match self.service.trigger_build(entry).await {
                Ok(Some(_)) => summary.queued += 1,
                Ok(None) => summary.idle += 1,
                Err(err) => {
                    summary.failed += 1;
                    error!(
                        stage = "poller",
                        trigger = %entry.descriptor().name(),
                        build_type = %entry.descriptor().build_type_id,
                        error = %err,
                        "trigger poll failed"
                    );
                }
            }
        }
        summary
    }
}
