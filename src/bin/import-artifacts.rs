use occupancy_scout::core::config::load_scout_config;
use occupancy_scout::storage::{import_artifact, ArtifactStore, ImportReport, OccupancyStore};
use std::path::PathBuf;

/// Load run artifacts into the occupancy database.
///
/// Usage: `import-artifacts [FILE.json ...]`. Without arguments every artifact
/// in the configured artifact directory is imported. Re-importing is safe:
/// samples already stored for the same location and timestamp are skipped.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = load_scout_config();
    let store = OccupancyStore::connect(
        &config.resolve_database_url(),
        config.resolve_db_max_connections(),
    )
    .await?;

    let mut paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        let artifacts = ArtifactStore::new(config.resolve_artifact_dir());
        paths = artifacts.list().await?;
        eprintln!(
            "📂 {} artifact(s) found in {}",
            paths.len(),
            artifacts.dir().display()
        );
    }

    let mut total = ImportReport::default();
    let mut unreadable = 0usize;
    for path in &paths {
        let artifact = match ArtifactStore::load(path).await {
            Ok(a) => a,
            Err(e) => {
                eprintln!("⚠️  skipping {}: {:#}", path.display(), e);
                unreadable += 1;
                continue;
            }
        };
        let report = import_artifact(&store, &artifact).await;
        eprintln!(
            "✅ {}: {} inserted, {} duplicate(s), {} failed result(s) skipped",
            path.display(),
            report.inserted,
            report.duplicates,
            report.skipped_failed
        );
        total.merge(&report);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "files": paths.len(),
            "unreadable_files": unreadable,
            "report": total,
        }))?
    );
    Ok(())
}
