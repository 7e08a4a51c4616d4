/// Orchestrator runs against a scripted automation backend.
mod support;

use async_trait::async_trait;
use occupancy_scout::pipeline::progress::{EventSink, ProgressStreamer, SinkClosed};
use occupancy_scout::{ArtifactStore, OccupancyStore, Orchestrator, RunArtifact, RunEvent, Target};
use std::sync::Arc;
use std::time::Duration;
use support::{fast_settings, init_logger, targets, Script, ScriptedAutomation};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn run_collecting(
    orchestrator: &Orchestrator,
    targets: Vec<Target>,
) -> (RunArtifact, Vec<RunEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let mut streamer = ProgressStreamer::new(tx);
    let artifact = orchestrator
        .run(targets, &mut streamer, CancellationToken::new())
        .await;
    drop(streamer);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (artifact, events)
}

fn progress_counts(events: &[RunEvent]) -> Vec<(usize, usize, u8)> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Progress {
                current,
                total,
                progress,
                ..
            } => Some((*current, *total, *progress)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_seven_targets_one_unreachable() {
    init_logger();
    let targets = targets(7);
    let broken = targets[0].url.clone();
    let automation = ScriptedAutomation::builder()
        .script(broken.clone(), Script::FailAlways)
        .nav_delay(Duration::from_millis(5))
        .build();
    let counters = automation.counters.clone();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 2, 1));

    let (artifact, events) = run_collecting(&orchestrator, targets).await;

    assert_eq!(artifact.results.len(), 7);
    assert!(!artifact.cancelled);
    assert!(artifact.fatal_error.is_none());

    let failed = artifact
        .results
        .iter()
        .find(|r| r.url == broken)
        .expect("result for the unreachable target");
    assert!(!failed.success);
    assert_eq!(failed.retries_used, 1);
    assert_eq!(failed.location_name.as_deref(), Some("Place 1"));
    assert!(failed.error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(counters.attempts_for(&broken), 2);

    let ok = artifact.results.iter().filter(|r| r.success).count();
    assert_eq!(ok, 6);
    assert_eq!(artifact.metrics.total_tasks, 7);
    assert!((artifact.metrics.success_rate - 85.714).abs() < 0.01);

    // Every leased page was closed exactly once and the cap held.
    assert_eq!(counters.opened(), 7);
    assert_eq!(counters.closed(), 7);
    assert!(counters.peak() <= 2, "peak {} exceeded cap", counters.peak());
    assert_eq!(
        counters
            .sessions_shut_down
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // progress(0/7) ... progress(7/7) then complete
    let progress = progress_counts(&events);
    assert_eq!(progress.first(), Some(&(0, 7, 0)));
    assert_eq!(progress.last(), Some(&(7, 7, 100)));
    assert!(progress.windows(2).all(|w| w[0].0 < w[1].0 && w[0].2 <= w[1].2));
    assert!(matches!(events.last(), Some(RunEvent::Complete { .. })));
    let streamed = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Result { .. }))
        .count();
    assert_eq!(streamed, 7);
}

#[tokio::test]
async fn test_concurrency_cap_holds_across_shapes() {
    init_logger();
    for (batch_size, max_concurrent) in [(1, 1), (3, 2), (5, 3), (10, 4), (2, 8)] {
        let automation = ScriptedAutomation::builder()
            .nav_delay(Duration::from_millis(15))
            .build();
        let counters = automation.counters.clone();
        let orchestrator = Orchestrator::new(
            Arc::new(automation),
            fast_settings(batch_size, max_concurrent, 0),
        );

        let (artifact, _) = run_collecting(&orchestrator, targets(12)).await;

        assert_eq!(artifact.results.len(), 12);
        assert!(
            counters.peak() <= max_concurrent,
            "B={} K={}: peak {} open pages",
            batch_size,
            max_concurrent,
            counters.peak()
        );
        assert_eq!(counters.opened(), counters.closed());
    }
}

#[tokio::test]
async fn test_transient_failures_recover_within_budget() {
    init_logger();
    let targets = targets(2);
    let flaky = targets[1].url.clone();
    let automation = ScriptedAutomation::builder()
        .script(flaky.clone(), Script::FailTimes(2))
        .build();
    let counters = automation.counters.clone();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 2, 3));

    let (artifact, _) = run_collecting(&orchestrator, targets).await;

    let result = artifact.results.iter().find(|r| r.url == flaky).unwrap();
    assert!(result.success);
    assert_eq!(result.retries_used, 2);
    assert_eq!(result.location_name.as_deref(), Some("Place 2 (live)"));
    assert_eq!(counters.attempts_for(&flaky), 3);
    assert_eq!(artifact.metrics.total_retries, 2);
}

/// Accepts events until the n-th result, then behaves like a closed connection.
struct DisconnectingSink {
    results_before_close: usize,
    seen_results: usize,
    events: Arc<std::sync::Mutex<Vec<RunEvent>>>,
}

#[async_trait]
impl EventSink for DisconnectingSink {
    async fn send(&mut self, event: RunEvent) -> Result<(), SinkClosed> {
        if matches!(event, RunEvent::Result { .. }) {
            self.seen_results += 1;
        }
        if self.seen_results > self.results_before_close {
            return Err(SinkClosed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn test_disconnect_stops_run_and_keeps_delivered_results() {
    init_logger();
    let targets = targets(7);
    let later: Vec<String> = targets[3..].iter().map(|t| t.url.clone()).collect();
    let automation = ScriptedAutomation::builder().build();
    let counters = automation.counters.clone();
    let mut settings = fast_settings(3, 1, 0);
    settings.batch_group_size = 1;
    let orchestrator = Orchestrator::new(Arc::new(automation), settings);

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut streamer = ProgressStreamer::new(DisconnectingSink {
        results_before_close: 2,
        seen_results: 0,
        events: events.clone(),
    });
    let artifact = orchestrator
        .run(targets, &mut streamer, CancellationToken::new())
        .await;

    assert!(artifact.cancelled);
    assert_eq!(artifact.results.len(), 2);
    assert!(!streamer.is_connected());
    for url in &later {
        assert_eq!(counters.attempts_for(url), 0, "{} was started after disconnect", url);
    }
    assert_eq!(counters.opened(), counters.closed());

    let delivered = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, RunEvent::Result { .. }))
        .count();
    assert_eq!(delivered, 2);
}

#[tokio::test]
async fn test_disconnect_during_retries_cancels_without_waiting_for_a_result() {
    init_logger();
    let targets = targets(4);
    let urls: Vec<String> = targets.iter().map(|t| t.url.clone()).collect();
    let mut builder = ScriptedAutomation::builder().nav_delay(Duration::from_millis(200));
    for url in &urls {
        builder = builder.script(url.clone(), Script::FailAlways);
    }
    let automation = builder.build();
    let counters = automation.counters.clone();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 2, 3));

    let (tx, mut rx) = mpsc::channel(256);
    let reader = tokio::spawn(async move {
        let first = rx.recv().await;
        drop(rx);
        first
    });

    let started = std::time::Instant::now();
    let mut streamer = ProgressStreamer::new(tx);
    let artifact = orchestrator
        .run(targets, &mut streamer, CancellationToken::new())
        .await;

    assert!(matches!(
        reader.await.unwrap(),
        Some(RunEvent::Progress { current: 0, .. })
    ));
    assert!(artifact.cancelled);
    assert!(artifact.results.is_empty());
    assert!(!streamer.is_connected());
    // Every task fails all four attempts at 200ms each, so a run that only
    // noticed the disconnect on its next send would take at least 800ms.
    assert!(started.elapsed() < Duration::from_millis(700));
    let attempts: u32 = urls.iter().map(|u| counters.attempts_for(u)).sum();
    assert!(attempts <= 2, "{} navigations after disconnect", attempts);
    assert_eq!(counters.opened(), counters.closed());
}

#[tokio::test]
async fn test_session_start_failure_ends_with_error_event() {
    init_logger();
    let automation = ScriptedAutomation::builder().fail_session().build();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 2, 1));

    let (artifact, events) = run_collecting(&orchestrator, targets(4)).await;

    assert!(artifact.results.is_empty());
    assert!(!artifact.cancelled);
    let fatal = artifact.fatal_error.expect("fatal error recorded");
    assert!(fatal.contains("browser binary missing"));
    match events.last() {
        Some(RunEvent::Error { error, .. }) => assert!(error.contains("browser binary missing")),
        other => panic!("expected a trailing error event, got {:?}", other),
    }
    assert!(matches!(
        events.first(),
        Some(RunEvent::Progress { current: 0, total: 4, .. })
    ));
}

#[tokio::test]
async fn test_lease_failure_aborts_only_its_batch() {
    init_logger();
    let automation = ScriptedAutomation::builder().failing_pages(1).build();
    let counters = automation.counters.clone();
    let mut settings = fast_settings(3, 1, 2);
    settings.batch_group_size = 1;
    let orchestrator = Orchestrator::new(Arc::new(automation), settings);

    let (artifact, events) = run_collecting(&orchestrator, targets(6)).await;

    assert_eq!(artifact.results.len(), 6);
    let (aborted, scraped): (Vec<_>, Vec<_>) =
        artifact.results.iter().partition(|r| !r.success);
    assert_eq!(aborted.len(), 3);
    assert_eq!(scraped.len(), 3);
    for r in &aborted {
        assert!(r.error.as_deref().unwrap_or_default().contains("batch 1 aborted"));
        assert_eq!(r.retries_used, 0);
    }
    // The second batch ran on fresh pages.
    assert_eq!(counters.opened(), 3);
    assert_eq!(counters.closed(), 3);
    assert!(matches!(events.last(), Some(RunEvent::Complete { .. })));
}

#[tokio::test]
async fn test_external_cancel_closes_every_page() {
    init_logger();
    let automation = ScriptedAutomation::builder()
        .nav_delay(Duration::from_millis(300))
        .build();
    let counters = automation.counters.clone();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 2, 0));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let (tx, mut rx) = mpsc::channel(256);
    let mut streamer = ProgressStreamer::new(tx);
    let artifact = orchestrator.run(targets(6), &mut streamer, cancel).await;
    drop(streamer);

    assert!(artifact.cancelled);
    assert!(artifact.results.len() < 6);
    assert_eq!(counters.opened(), counters.closed());
    assert!(counters.peak() <= 2);

    let mut last = None;
    while let Some(event) = rx.recv().await {
        last = Some(event);
    }
    match last {
        Some(RunEvent::Error { error, .. }) => assert_eq!(error, "run cancelled"),
        other => panic!("expected a cancellation error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_successful_results_are_persisted_and_artifact_written() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let store = OccupancyStore::in_memory().await.unwrap();
    let artifacts = ArtifactStore::new(dir.path());

    let targets = targets(3);
    let broken = targets[2].url.clone();
    let automation = ScriptedAutomation::builder()
        .script(broken.clone(), Script::FailAlways)
        .build();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 3, 0))
        .with_store(Some(store.clone()))
        .with_artifacts(artifacts.clone());

    let (artifact, _) = run_collecting(&orchestrator, targets.clone()).await;
    assert_eq!(artifact.results.len(), 3);

    for target in &targets[..2] {
        let location = store
            .location_by_url(&target.url)
            .await
            .unwrap()
            .expect("location stored");
        assert_eq!(location.rating, Some(4.5));
        assert_eq!(store.sample_count(location.id).await.unwrap(), 1);
    }
    assert!(store.location_by_url(&broken).await.unwrap().is_none());

    let written = artifacts.list().await.unwrap();
    assert_eq!(written.len(), 1);
    let latest = artifacts.latest().await.unwrap().unwrap();
    assert_eq!(latest.run_id, artifact.run_id);
    assert_eq!(latest.results.len(), 3);
}

#[tokio::test]
async fn test_empty_target_list_completes_immediately() {
    init_logger();
    let automation = ScriptedAutomation::builder().build();
    let counters = automation.counters.clone();
    let orchestrator = Orchestrator::new(Arc::new(automation), fast_settings(3, 2, 1));

    let (artifact, events) = run_collecting(&orchestrator, Vec::new()).await;

    assert!(artifact.results.is_empty());
    assert_eq!(artifact.metrics.success_rate, 0.0);
    assert_eq!(
        counters
            .sessions_started
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert_eq!(events.len(), 2);
    assert!(matches!(events.last(), Some(RunEvent::Complete { .. })));
}
