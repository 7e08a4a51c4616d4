//! One run: targets in, streamed results and a run artifact out.
//!
//! All task futures are driven from the calling task: each batch is a
//! `buffer_unordered` stream, the batches of a launch group are merged with
//! `select_all`, and results are handled in completion order from that one
//! loop. The limiter, not the batch boundary, caps concurrency.

use crate::core::config::RunSettings;
use crate::core::error::ScrapeError;
use crate::pipeline::batcher;
use crate::pipeline::limiter::ConcurrencyLimiter;
use crate::pipeline::progress::ProgressStreamer;
use crate::pipeline::retry::{RetryController, RetryDecision};
use crate::scraping::automation::{Automation, PageHandle};
use crate::scraping::resource_pool::ResourcePool;
use crate::storage::{ArtifactStore, OccupancyStore};
use crate::types::{
    Batch, BatchInfo, RawExtraction, RunArtifact, RunMetrics, ScrapeResult, ScrapeTask, Target,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Set once when leasing a page for a batch fails; later tasks of that batch
/// fail fast with the same reason.
type BatchAbort = Arc<OnceLock<String>>;

enum TaskOutcome {
    Scraped { raw: RawExtraction, retries: u32 },
    Failed { error: ScrapeError, retries: u32 },
    Cancelled,
}

#[derive(Clone)]
pub struct Orchestrator {
    automation: Arc<dyn Automation>,
    settings: RunSettings,
    store: Option<OccupancyStore>,
    artifacts: Option<ArtifactStore>,
}

impl Orchestrator {
    pub fn new(automation: Arc<dyn Automation>, settings: RunSettings) -> Self {
        Self {
            automation,
            settings,
            store: None,
            artifacts: None,
        }
    }

    pub fn with_store(mut self, store: Option<OccupancyStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Execute one run to completion, cancellation, or a run-fatal error.
    ///
    /// The stream always ends with `complete` or `error` (unless the caller is
    /// gone). The returned artifact holds exactly the results the caller
    /// received before cancellation; unfinished tasks are omitted.
    pub async fn run(
        &self,
        targets: Vec<Target>,
        streamer: &mut ProgressStreamer,
        cancel: CancellationToken,
    ) -> RunArtifact {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = targets.len();

        info!(
            "🏁 run {} started: {} target(s), batch size {}, max concurrent {}",
            run_id, total, self.settings.batch_size, self.settings.max_concurrent
        );

        if !streamer.start(total).await {
            cancel.cancel();
        }

        let mut results: Vec<ScrapeResult> = Vec::with_capacity(total);
        let mut fatal_error: Option<String> = None;

        if total > 0 && !cancel.is_cancelled() {
            match self.automation.start_session().await {
                Ok(session) => {
                    let pool = ResourcePool::new(session, self.settings.block_policy.clone());
                    self.run_batches(targets, &pool, streamer, &mut results, &cancel)
                        .await;
                    pool.shutdown().await;
                    let gauge = pool.gauge();
                    debug!(
                        "pages leased {}, released {}, peak open {}",
                        gauge.leased(),
                        gauge.released(),
                        gauge.peak()
                    );
                }
                Err(e) => {
                    error!("❌ run {}: could not start automation session: {}", run_id, e);
                    fatal_error = Some(e.to_string());
                }
            }
        }

        let cancelled = cancel.is_cancelled() && fatal_error.is_none();
        let metrics = RunMetrics::compute(&results, clock.elapsed());
        info!("📊 run {} finished: {}", run_id, metrics.summary());

        let artifact = RunArtifact {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_targets: total,
            cancelled,
            fatal_error: fatal_error.clone(),
            metrics,
            results,
        };

        if let Some(artifacts) = &self.artifacts {
            if let Err(e) = artifacts.write(&artifact).await {
                warn!("run artifact not written: {:#}", e);
            }
        }

        if let Some(message) = fatal_error {
            streamer.error(message).await;
        } else if cancelled {
            streamer.error("run cancelled").await;
        } else {
            streamer.complete().await;
        }

        artifact
    }

    async fn run_batches(
        &self,
        targets: Vec<Target>,
        pool: &ResourcePool,
        streamer: &mut ProgressStreamer,
        results: &mut Vec<ScrapeResult>,
        cancel: &CancellationToken,
    ) {
        let limiter = ConcurrencyLimiter::new(self.settings.max_concurrent);
        let batches = batcher::split(targets, self.settings.batch_size);
        let group_size = self.settings.batch_group_size.max(1);
        let total_batches = batches.len();
        let group_count = total_batches.div_ceil(group_size);

        let mut batches = batches.into_iter().peekable();
        let mut group_index = 0;
        while batches.peek().is_some() {
            if cancel.is_cancelled() {
                break;
            }
            if group_index > 0 && !self.settings.inter_batch_pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.inter_batch_pause) => {}
                }
            }
            group_index += 1;

            let group: Vec<Batch> = batches.by_ref().take(group_size).collect();
            info!(
                "🚚 launching batch group {}/{} (batches {:?})",
                group_index,
                group_count,
                group.iter().map(|b| b.id).collect::<Vec<_>>()
            );

            let limiter = &limiter;
            let mut merged = stream::select_all(group.into_iter().map(|batch| {
                let abort: BatchAbort = Arc::new(OnceLock::new());
                let width = batch.len().max(1);
                let info = BatchInfo {
                    current_batch: batch.id,
                    total_batches,
                };
                stream::iter(batch.tasks)
                    .map(move |task| {
                        let abort = abort.clone();
                        async move {
                            self.run_task(task, pool, limiter, cancel, abort)
                                .await
                                .map(|result| (info, result))
                        }
                    })
                    .buffer_unordered(width)
            }));

            loop {
                // Watching the sink here catches a disconnect while every task
                // is still navigating or backing off.
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = streamer.closed() => {
                        warn!("🔌 caller gone; cancelling remaining work");
                        cancel.cancel();
                        break;
                    }
                    next = merged.next() => next,
                };
                let Some(outcome) = next else {
                    break;
                };
                let Some((info, result)) = outcome else {
                    continue;
                };
                if !streamer.result(&result, Some(info)).await {
                    warn!("🔌 caller gone; cancelling remaining work");
                    cancel.cancel();
                    break;
                }
                self.persist(&result).await;
                results.push(result);
            }

            if cancel.is_cancelled() {
                // Let in-flight tasks observe cancellation and close their pages;
                // anything still running after the grace period is dropped.
                let drained = tokio::time::timeout(self.settings.cancel_grace, async {
                    while merged.next().await.is_some() {}
                })
                .await;
                if drained.is_err() {
                    warn!(
                        "⏱️ in-flight tasks did not finish within {:?}; abandoning them",
                        self.settings.cancel_grace
                    );
                }
                break;
            }
        }
    }

    async fn persist(&self, result: &ScrapeResult) {
        let Some(store) = &self.store else {
            return;
        };
        if !result.success {
            return;
        }
        if let Err(e) = store.persist_result(result).await {
            warn!("persisting {} failed (continuing stream-only): {:#}", result.url, e);
        }
    }

    /// `None` when the task was cancelled before producing a result.
    async fn run_task(
        &self,
        task: ScrapeTask,
        pool: &ResourcePool,
        limiter: &ConcurrencyLimiter,
        cancel: &CancellationToken,
        abort: BatchAbort,
    ) -> Option<ScrapeResult> {
        let ScrapeTask {
            target, batch_id, ..
        } = task;

        if let Some(reason) = abort.get() {
            return Some(ScrapeResult::failed(&target, reason.clone(), 0, 0));
        }

        let permit = limiter.acquire(cancel).await?;
        let started = Instant::now();

        if let Some(reason) = abort.get() {
            return Some(ScrapeResult::failed(&target, reason.clone(), 0, 0));
        }

        let mut lease = match pool.lease().await {
            Ok(lease) => lease,
            Err(e) => {
                let reason = format!("batch {} aborted: {}", batch_id, e);
                error!("❌ {}", reason);
                let _ = abort.set(reason.clone());
                let elapsed = started.elapsed().as_millis() as u64;
                return Some(ScrapeResult::failed(&target, reason, elapsed, 0));
            }
        };

        let outcome = match lease.page_mut() {
            Some(page) => self.scrape_with_retries(page, &target, cancel).await,
            None => TaskOutcome::Failed {
                error: ScrapeError::Session("page released before use".into()),
                retries: 0,
            },
        };
        lease.release().await;
        drop(permit);

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            TaskOutcome::Scraped { raw, retries } => {
                let result = ScrapeResult::scraped(&target, raw, elapsed, retries);
                info!(
                    "✅ {} ({}ms, {} retr{})",
                    result.location_name.as_deref().unwrap_or(&target.url),
                    elapsed,
                    retries,
                    if retries == 1 { "y" } else { "ies" }
                );
                Some(result)
            }
            TaskOutcome::Failed { error, retries } => {
                warn!("❌ {} failed after {} retries: {}", target.url, retries, error);
                Some(ScrapeResult::failed(&target, error.to_string(), elapsed, retries))
            }
            TaskOutcome::Cancelled => {
                debug!("task for {} cancelled", target.url);
                None
            }
        }
    }

    async fn scrape_with_retries(
        &self,
        page: &mut dyn PageHandle,
        target: &Target,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let mut retry = RetryController::new(&self.settings.retry, cancel);
        while let Some(attempt) = retry.begin_attempt() {
            let timeout = self.settings.nav_timeout_for(attempt);
            let attempted = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
                r = scrape_once(page, &target.url, timeout) => r,
            };
            let error = match attempted {
                Ok(raw) => {
                    return TaskOutcome::Scraped {
                        raw,
                        retries: retry.retries_used(),
                    }
                }
                Err(e) => e,
            };
            match retry.after_failure(&error).await {
                RetryDecision::Retry => {
                    warn!(
                        "🔁 {} attempt {} failed ({}); retrying",
                        target.url,
                        attempt + 1,
                        error
                    );
                }
                RetryDecision::GiveUp => {
                    return TaskOutcome::Failed {
                        error,
                        retries: retry.retries_used(),
                    }
                }
                RetryDecision::Cancelled => return TaskOutcome::Cancelled,
            }
        }
        TaskOutcome::Cancelled
    }
}

async fn scrape_once(
    page: &mut dyn PageHandle,
    url: &str,
    timeout: Duration,
) -> Result<RawExtraction, ScrapeError> {
    page.goto(url, timeout).await?;
    let raw = page.extract().await?;
    if raw.has_signal() {
        Ok(raw)
    } else {
        Err(ScrapeError::NoData)
    }
}
