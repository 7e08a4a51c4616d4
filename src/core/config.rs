use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::retry::RetryPolicy;
use crate::scraping::block_policy::BlockPolicy;

// ---------------------------------------------------------------------------
// ScoutConfig: file-based config loader (occupancy-scout.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "OCCUPANCY_SCOUT_CONFIG";

/// Top-level config loaded from `occupancy-scout.json`.
///
/// Every field is optional; the `resolve_*` accessors apply
/// JSON field → env var → built-in default.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ScoutConfig {
    /// Targets per batch. Default: 3.
    pub batch_size: Option<usize>,
    /// System-wide cap on in-flight scrape tasks. Default: 10.
    pub max_concurrent: Option<usize>,
    /// Batches launched together before the inter-batch pause. Default: 3.
    pub batch_group_size: Option<usize>,
    /// Retries after the first attempt. Default: 3.
    pub max_retries: Option<u32>,
    pub inter_batch_pause_ms: Option<u64>,
    pub retry_base_min_secs: Option<f64>,
    pub retry_base_max_secs: Option<f64>,
    pub retry_step_min_secs: Option<f64>,
    pub retry_step_max_secs: Option<f64>,
    pub nav_timeout_ms: Option<u64>,
    pub nav_timeout_step_ms: Option<u64>,
    /// How long in-flight tasks may take to release handles after cancellation.
    pub cancel_grace_ms: Option<u64>,
    /// Extra deny-list substrings on top of the built-in ad/tracker list.
    #[serde(default)]
    pub block_list: Vec<String>,
    /// Block images, stylesheets and fonts. Default: true.
    pub block_assets: Option<bool>,
    pub database_url: Option<String>,
    pub db_max_connections: Option<u32>,
    pub artifact_dir: Option<String>,
    pub targets_path: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub schedule_min_minutes: Option<u64>,
    pub schedule_max_minutes: Option<u64>,
    pub allow_manual_runs: Option<bool>,
    pub geo_lookup_enabled: Option<bool>,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    let v = std::env::var(key).ok()?;
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `~/.occupancy-scout`, or the working directory when no home is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".occupancy-scout"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl ScoutConfig {
    pub fn resolve_batch_size(&self) -> usize {
        self.batch_size
            .or_else(|| env_parse("SCOUT_BATCH_SIZE"))
            .unwrap_or(3)
            .max(1)
    }

    pub fn resolve_max_concurrent(&self) -> usize {
        self.max_concurrent
            .or_else(|| env_parse("SCOUT_MAX_CONCURRENT"))
            .unwrap_or(10)
            .max(1)
    }

    pub fn resolve_batch_group_size(&self) -> usize {
        self.batch_group_size
            .or_else(|| env_parse("SCOUT_BATCH_GROUP_SIZE"))
            .unwrap_or(3)
            .max(1)
    }

    pub fn resolve_max_retries(&self) -> u32 {
        self.max_retries
            .or_else(|| env_parse("SCOUT_MAX_RETRIES"))
            .unwrap_or(3)
    }

    pub fn resolve_inter_batch_pause(&self) -> Duration {
        Duration::from_millis(
            self.inter_batch_pause_ms
                .or_else(|| env_parse("SCOUT_INTER_BATCH_PAUSE_MS"))
                .unwrap_or(1000),
        )
    }

    pub fn resolve_retry_policy(&self) -> RetryPolicy {
        let secs = |v: Option<f64>, default: f64| Duration::from_secs_f64(v.unwrap_or(default).max(0.0));
        RetryPolicy {
            max_retries: self.resolve_max_retries(),
            base_min: secs(self.retry_base_min_secs, 3.0),
            base_max: secs(self.retry_base_max_secs, 8.0),
            step_min: secs(self.retry_step_min_secs, 1.0),
            step_max: secs(self.retry_step_max_secs, 3.0),
        }
    }

    pub fn resolve_nav_timeout(&self) -> Duration {
        Duration::from_millis(
            self.nav_timeout_ms
                .or_else(|| env_parse("SCOUT_NAV_TIMEOUT_MS"))
                .unwrap_or(15_000),
        )
    }

    pub fn resolve_nav_timeout_step(&self) -> Duration {
        Duration::from_millis(self.nav_timeout_step_ms.unwrap_or(10_000))
    }

    pub fn resolve_cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms.unwrap_or(5_000))
    }

    pub fn resolve_block_policy(&self) -> BlockPolicy {
        BlockPolicy::new(&self.block_list, self.block_assets.unwrap_or(true))
    }

    /// Database URL: JSON field → `DATABASE_URL` → `sqlite://~/.occupancy-scout/occupancy.db`.
    pub fn resolve_database_url(&self) -> String {
        if let Some(u) = self.database_url.as_ref().filter(|u| !u.trim().is_empty()) {
            return u.clone();
        }
        env_string("DATABASE_URL").unwrap_or_else(|| {
            format!(
                "sqlite://{}?mode=rwc",
                data_dir().join("occupancy.db").to_string_lossy()
            )
        })
    }

    pub fn resolve_db_max_connections(&self) -> u32 {
        self.db_max_connections
            .or_else(|| env_parse("SCOUT_DB_MAX_CONNECTIONS"))
            .unwrap_or(5)
            .max(1)
    }

    pub fn resolve_artifact_dir(&self) -> PathBuf {
        self.artifact_dir
            .clone()
            .or_else(|| env_string("SCOUT_ARTIFACT_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("scrapings"))
    }

    pub fn resolve_targets_path(&self) -> PathBuf {
        self.targets_path
            .clone()
            .or_else(|| env_string("SCOUT_TARGETS"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("targets.json"))
    }

    pub fn resolve_schedule_enabled(&self) -> bool {
        self.schedule_enabled
            .or_else(|| env_flag("SCOUT_SCHEDULE"))
            .unwrap_or(false)
    }

    /// Sleep window between scheduled sweeps, as `(min, max)`.
    pub fn resolve_schedule_window(&self) -> (Duration, Duration) {
        let min = self.schedule_min_minutes.unwrap_or(20);
        let max = self.schedule_max_minutes.unwrap_or(30).max(min);
        (
            Duration::from_secs(min * 60),
            Duration::from_secs(max * 60),
        )
    }

    pub fn resolve_allow_manual_runs(&self) -> bool {
        self.allow_manual_runs
            .or_else(|| env_flag("SCOUT_ALLOW_MANUAL_RUNS"))
            .unwrap_or(true)
    }

    pub fn resolve_geo_lookup_enabled(&self) -> bool {
        self.geo_lookup_enabled
            .or_else(|| env_flag("SCOUT_GEO_LOOKUP"))
            .unwrap_or(true)
    }

    /// Everything one orchestrator run needs, resolved once.
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            batch_size: self.resolve_batch_size(),
            max_concurrent: self.resolve_max_concurrent(),
            batch_group_size: self.resolve_batch_group_size(),
            inter_batch_pause: self.resolve_inter_batch_pause(),
            retry: self.resolve_retry_policy(),
            nav_timeout: self.resolve_nav_timeout(),
            nav_timeout_step: self.resolve_nav_timeout_step(),
            cancel_grace: self.resolve_cancel_grace(),
            block_policy: self.resolve_block_policy(),
        }
    }
}

/// Resolved per-run knobs.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub batch_group_size: usize,
    pub inter_batch_pause: Duration,
    pub retry: RetryPolicy,
    pub nav_timeout: Duration,
    pub nav_timeout_step: Duration,
    pub cancel_grace: Duration,
    pub block_policy: BlockPolicy,
}

impl RunSettings {
    /// Navigation timeout for a 0-based attempt number.
    pub fn nav_timeout_for(&self, attempt: u32) -> Duration {
        self.nav_timeout + self.nav_timeout_step * attempt
    }
}

/// Load `occupancy-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `OCCUPANCY_SCOUT_CONFIG` env var path
/// 2. `./occupancy-scout.json`
/// 3. `../occupancy-scout.json`
///
/// Missing file → `ScoutConfig::default()`. Parse error → warning + defaults.
pub fn load_scout_config() -> ScoutConfig {
    let mut candidates = vec![
        PathBuf::from("occupancy-scout.json"),
        PathBuf::from("../occupancy-scout.json"),
    ];
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        match serde_json::from_str::<ScoutConfig>(&contents) {
            Ok(cfg) => {
                tracing::info!("occupancy-scout.json loaded from {}", path.display());
                return cfg;
            }
            Err(e) => {
                tracing::warn!(
                    "occupancy-scout.json parse error at {}: {}; using defaults",
                    path.display(),
                    e
                );
                return ScoutConfig::default();
            }
        }
    }

    ScoutConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fields_take_precedence() {
        let cfg: ScoutConfig = serde_json::from_str(
            r#"{"batch_size": 5, "max_concurrent": 2, "max_retries": 1, "block_list": ["tracker.example"]}"#,
        )
        .unwrap();
        let settings = cfg.run_settings();
        assert_eq!(settings.batch_size, 5);
        assert_eq!(settings.max_concurrent, 2);
        assert_eq!(settings.retry.max_retries, 1);
        assert!(settings
            .block_policy
            .blocks_url("https://tracker.example/pixel"));
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let cfg = ScoutConfig {
            batch_size: Some(0),
            max_concurrent: Some(0),
            batch_group_size: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_batch_size(), 1);
        assert_eq!(cfg.resolve_max_concurrent(), 1);
        assert_eq!(cfg.resolve_batch_group_size(), 1);
    }

    #[test]
    fn nav_timeout_grows_per_attempt() {
        let cfg = ScoutConfig {
            nav_timeout_ms: Some(15_000),
            nav_timeout_step_ms: Some(10_000),
            ..Default::default()
        };
        let settings = cfg.run_settings();
        assert_eq!(settings.nav_timeout_for(0), Duration::from_secs(15));
        assert_eq!(settings.nav_timeout_for(2), Duration::from_secs(35));
    }

    #[test]
    fn schedule_window_never_inverted() {
        let cfg = ScoutConfig {
            schedule_min_minutes: Some(40),
            schedule_max_minutes: Some(10),
            ..Default::default()
        };
        let (min, max) = cfg.resolve_schedule_window();
        assert_eq!(min, max);
    }
}
