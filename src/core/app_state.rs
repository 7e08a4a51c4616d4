use crate::core::config::ScoutConfig;
use crate::features::geo_cache::GeoCache;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::progress::ProgressStreamer;
use crate::scraping::automation::Automation;
use crate::storage::{ArtifactStore, OccupancyStore};
use crate::types::{RunArtifact, Target};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Held for the whole lifetime of a run; only one run may be active.
pub type RunGuard = OwnedMutexGuard<()>;

#[derive(Clone)]
pub struct AppState {
    /// File-based config loaded from `occupancy-scout.json` (env-var fallback for all fields).
    pub config: Arc<ScoutConfig>,
    pub automation: Arc<dyn Automation>,
    pub orchestrator: Arc<Orchestrator>,
    /// `None` when the database could not be opened; runs are then stream-only.
    pub store: Option<OccupancyStore>,
    pub artifacts: ArtifactStore,
    pub geo: GeoCache,
    run_lock: Arc<Mutex<()>>,
    /// Cancelled on process shutdown; every run uses a child token.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("automation_available", &self.automation.is_available())
            .field("store_enabled", &self.store.is_some())
            .field("artifact_dir", &self.artifacts.dir())
            .field("run_active", &self.is_run_active())
            .finish()
    }
}

impl AppState {
    pub fn new(
        config: ScoutConfig,
        automation: Arc<dyn Automation>,
        store: Option<OccupancyStore>,
        http_client: reqwest::Client,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.resolve_artifact_dir());
        let orchestrator = Orchestrator::new(automation.clone(), config.run_settings())
            .with_store(store.clone())
            .with_artifacts(artifacts.clone());
        let geo = GeoCache::new(http_client, config.resolve_geo_lookup_enabled());
        Self {
            config: Arc::new(config),
            automation,
            orchestrator: Arc::new(orchestrator),
            store,
            artifacts,
            geo,
            run_lock: Arc::new(Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_geo(mut self, geo: GeoCache) -> Self {
        self.geo = geo;
        self
    }

    pub fn is_run_active(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Claim the single run slot; `None` while another run is in progress.
    pub fn try_begin_run(&self) -> Option<RunGuard> {
        self.run_lock.clone().try_lock_owned().ok()
    }

    /// Start a run in the background. It stops early on shutdown and releases
    /// `guard` when done.
    pub fn spawn_run(
        &self,
        targets: Vec<Target>,
        mut streamer: ProgressStreamer,
        guard: RunGuard,
    ) -> JoinHandle<RunArtifact> {
        let orchestrator = self.orchestrator.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let _guard = guard;
            let artifact = orchestrator.run(targets, &mut streamer, cancel).await;
            info!(
                "run {} closed: {} result(s){}",
                artifact.run_id,
                artifact.results.len(),
                if artifact.cancelled { " (cancelled)" } else { "" }
            );
            artifact
        })
    }
}
