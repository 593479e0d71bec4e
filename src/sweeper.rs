//! Periodic reclamation of expired and idle previews.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SweeperConfig;
use crate::sandbox::{PreviewEnvironment, PreviewManager};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Environments inspected.
    pub checked: usize,
    /// Environments stopped for exceeding a threshold.
    pub stopped: usize,
    /// Environments whose teardown failed.
    pub failed: usize,
    /// Running environments found to have crashed.
    pub crashed: usize,
}

/// Stops previews that outlived `max_lifetime` or sat idle past `idle_timeout`.
#[derive(Clone)]
pub struct Sweeper {
    previews: PreviewManager,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(previews: PreviewManager, config: SweeperConfig) -> Self {
        Self { previews, config }
    }

    /// Sweeps using the current time.
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweeps as if the clock read `now`.
    ///
    /// A failure to stop one environment is logged and does not prevent the
    /// rest from being swept.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            checked: self.previews.list_previews().len(),
            ..Default::default()
        };

        let (max_lifetime, idle_timeout) = (self.config.max_lifetime(), self.config.idle_timeout());
        let expired = self.previews.expired_previews(now, max_lifetime, idle_timeout);

        // An update may replace an environment between listing and stopping;
        // only the environment that was judged stale is torn down.
        for env in expired {
            let project_id = env.project_id;
            let preview_id = env.preview_id;
            let judged = preview_id.clone();
            let still_stale = move |current: &PreviewEnvironment| {
                current.preview_id == judged && current.is_stale(now, max_lifetime, idle_timeout)
            };
            match self.previews.stop_preview_if(&project_id, still_stale).await {
                Ok(true) => {
                    tracing::info!(project = %project_id, preview = %preview_id, "swept expired preview");
                    report.stopped += 1;
                }
                Ok(false) => {
                    tracing::debug!(project = %project_id, preview = %preview_id, "preview replaced before sweep");
                }
                Err(e) => {
                    tracing::error!(project = %project_id, error = %e, "failed to sweep preview");
                    report.failed += 1;
                }
            }
        }

        for env in self.previews.list_previews() {
            let before = env.status;
            let after = self.previews.refresh_status(&env.project_id).await;
            if after.is_some_and(|s| s != before) {
                report.crashed += 1;
            }
        }

        if report.stopped > 0 || report.failed > 0 || report.crashed > 0 {
            tracing::info!(
                checked = report.checked,
                stopped = report.stopped,
                failed = report.failed,
                crashed = report.crashed,
                "sweep complete"
            );
        }
        report
    }

    /// Runs [`sweep_once`](Self::sweep_once) every interval until `token` is
    /// cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            tracing::info!(interval = ?self.config.interval(), "sweeper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
            tracing::info!("sweeper stopped");
        })
    }
}
