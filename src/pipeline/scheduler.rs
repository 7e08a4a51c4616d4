//! Unattended sweeps over the configured targets at randomized intervals.

use crate::core::AppState;
use crate::pipeline::progress::ProgressStreamer;
use crate::pipeline::retry::sample_between;
use crate::pipeline::targets::load_targets;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Scheduler {
    targets_path: PathBuf,
    window: (Duration, Duration),
}

impl Scheduler {
    pub fn new(targets_path: impl Into<PathBuf>, window: (Duration, Duration)) -> Self {
        let (min, max) = window;
        Self {
            targets_path: targets_path.into(),
            window: (min, max.max(min)),
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.config.resolve_targets_path(),
            state.config.resolve_schedule_window(),
        )
    }

    /// Randomized pause until the next sweep, within the window.
    pub fn next_delay(&self) -> Duration {
        sample_between(self.window.0, self.window.1)
    }

    /// One sweep. Skipped when a manual run holds the run slot.
    pub async fn sweep(&self, state: &AppState) {
        let targets = match load_targets(&self.targets_path).await {
            Ok(t) if !t.is_empty() => t,
            Ok(_) => {
                warn!("⏰ scheduled sweep skipped: no targets in {}", self.targets_path.display());
                return;
            }
            Err(e) => {
                warn!("⏰ scheduled sweep skipped: {:#}", e);
                return;
            }
        };
        let Some(guard) = state.try_begin_run() else {
            info!("⏰ scheduled sweep skipped: a run is already in progress");
            return;
        };
        info!("⏰ scheduled sweep over {} target(s)", targets.len());
        if let Err(e) = state
            .spawn_run(targets, ProgressStreamer::unattended(), guard)
            .await
        {
            warn!("scheduled run task failed: {}", e);
        }
    }

    /// Sweep, sleep, repeat until shutdown.
    pub async fn run(self, state: AppState) {
        let shutdown = state.shutdown.clone();
        info!(
            "⏰ scheduler started (every {}-{} min)",
            self.window.0.as_secs() / 60,
            self.window.1.as_secs() / 60
        );
        while !shutdown.is_cancelled() {
            self.sweep(&state).await;
            let delay = self.next_delay();
            info!("⏰ next sweep in {:.1} min", delay.as_secs_f64() / 60.0);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("⏰ scheduler stopped");
    }
}
