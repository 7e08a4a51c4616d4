//! Run artifacts: one compact JSON file per run, `scraping_YYYYMMDD_HHMMSS.json`.

use crate::storage::occupancy_store::OccupancyStore;
use crate::types::RunArtifact;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PREFIX: &str = "scraping_";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the artifact once; never overwrites an existing file.
    pub async fn write(&self, artifact: &RunArtifact) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create artifact dir {}", self.dir.display()))?;

        let stamp = artifact.finished_at.format("%Y%m%d_%H%M%S").to_string();
        let mut path = self.dir.join(format!("{PREFIX}{stamp}{SUFFIX}"));
        let mut n = 1;
        while tokio::fs::try_exists(&path).await.unwrap_or(false) {
            // Zero-padded so lexical order stays chronological.
            path = self.dir.join(format!("{PREFIX}{stamp}_{n:03}{SUFFIX}"));
            n += 1;
        }

        let json = serde_json::to_vec(artifact).context("failed to encode run artifact")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("💾 run artifact written: {}", path.display());
        Ok(path)
    }

    /// Artifact files, oldest first. A missing directory is an empty list.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", self.dir.display())),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(PREFIX) && name.ends_with(SUFFIX) {
                files.push(entry.path());
            }
        }
        // Timestamped names sort chronologically.
        files.sort();
        Ok(files)
    }

    pub async fn load(path: &Path) -> Result<RunArtifact> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("invalid run artifact {}", path.display()))
    }

    /// Most recent artifact of a run that finished normally. Corrupt files,
    /// cancelled runs and runs that failed to start are skipped.
    pub async fn latest(&self) -> Result<Option<RunArtifact>> {
        for path in self.list().await?.iter().rev() {
            match Self::load(path).await {
                Ok(artifact) if artifact.is_complete() => return Ok(Some(artifact)),
                Ok(artifact) => debug!(
                    "skipping incomplete run {} ({})",
                    artifact.run_id,
                    path.display()
                ),
                Err(e) => warn!("skipping unreadable artifact: {:#}", e),
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub results: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped_failed: usize,
    pub errors: usize,
}

impl ImportReport {
    pub fn merge(&mut self, other: &ImportReport) {
        self.results += other.results;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.skipped_failed += other.skipped_failed;
        self.errors += other.errors;
    }
}

/// Re-persist every result of `artifact`. Safe to repeat: samples already
/// stored are counted as duplicates.
pub async fn import_artifact(store: &OccupancyStore, artifact: &RunArtifact) -> ImportReport {
    let mut report = ImportReport {
        results: artifact.results.len(),
        ..Default::default()
    };
    for result in &artifact.results {
        if !result.success {
            report.skipped_failed += 1;
            continue;
        }
        match store.persist_result(result).await {
            Ok(true) => report.inserted += 1,
            Ok(false) => report.duplicates += 1,
            Err(e) => {
                warn!("import failed for {}: {:#}", result.url, e);
                report.errors += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunMetrics, ScrapeResult, Target};
    use chrono::{TimeZone, Utc};

    fn artifact(second: u32) -> RunArtifact {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 18, 30, second).unwrap();
        let mut ok = ScrapeResult::failed(&Target::new("Club", "https://maps.example/place/club"), "", 5, 0);
        ok.success = true;
        ok.error = None;
        ok.live_occupancy = Some("Derzeit zu 45 % ausgelastet".into());
        ok.timestamp = at;
        let failed = ScrapeResult::failed(&Target::new("Bar", "https://maps.example/place/bar"), "timeout", 5, 1);
        RunArtifact {
            run_id: format!("run-{second}"),
            started_at: at,
            finished_at: at,
            total_targets: 2,
            cancelled: false,
            fatal_error: None,
            metrics: RunMetrics::default(),
            results: vec![ok, failed],
        }
    }

    #[tokio::test]
    async fn latest_picks_newest_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.latest().await.unwrap().is_none());

        let first = store.write(&artifact(1)).await.unwrap();
        store.write(&artifact(2)).await.unwrap();
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("scraping_20260301_183001"));

        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.run_id, "run-2");
    }

    #[tokio::test]
    async fn same_second_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let a = store.write(&artifact(5)).await.unwrap();
        let b = store.write(&artifact(5)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn collision_suffix_keeps_listing_chronological() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut written = Vec::new();
        for i in 0..12 {
            let mut run = artifact(7);
            run.run_id = format!("same-second-{i}");
            written.push(store.write(&run).await.unwrap());
        }
        assert_eq!(store.list().await.unwrap(), written);
        assert!(written[10].to_string_lossy().ends_with("_010.json"));
        assert_eq!(store.latest().await.unwrap().unwrap().run_id, "same-second-11");
    }

    #[tokio::test]
    async fn latest_skips_cancelled_and_fatal_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.write(&artifact(1)).await.unwrap();

        let mut cancelled = artifact(2);
        cancelled.cancelled = true;
        store.write(&cancelled).await.unwrap();

        let mut fatal = artifact(3);
        fatal.fatal_error = Some("browser binary missing".into());
        fatal.results.clear();
        store.write(&fatal).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 3);
        assert_eq!(store.latest().await.unwrap().unwrap().run_id, "run-1");
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let db = OccupancyStore::in_memory().await.unwrap();
        let run = artifact(3);
        let first = import_artifact(&db, &run).await;
        assert_eq!(first.inserted, 1);
        assert_eq!(first.skipped_failed, 1);
        let second = import_artifact(&db, &run).await;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 1);
    }
}
