use std::sync::Arc;
use tracing::{info, warn};

use occupancy_scout::core::config::load_scout_config;
use occupancy_scout::pipeline::progress::ProgressStreamer;
use occupancy_scout::pipeline::scheduler::Scheduler;
use occupancy_scout::pipeline::targets::load_targets;
use occupancy_scout::scraping::Automation;
use occupancy_scout::{server, AppState, ChromiumAutomation, OccupancyStore};

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

fn port_from_env() -> Option<u16> {
    for k in ["SCOUT_PORT", "PORT"] {
        if let Ok(v) = std::env::var(k) {
            if let Ok(p) = v.trim().parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = load_scout_config();

    let http_timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(http_timeout))
        .build()?;

    // A broken database degrades runs to stream-only instead of refusing to start.
    let database_url = config.resolve_database_url();
    let store = match OccupancyStore::connect(&database_url, config.resolve_db_max_connections()).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("Storage unavailable ({:#}). Continuing without persistence.", e);
            None
        }
    };

    let automation = Arc::new(ChromiumAutomation::new_auto());
    if !automation.is_available() {
        warn!("No Chromium-family browser found; runs will fail until one is installed (or CHROME_EXECUTABLE is set).");
    }

    let state = AppState::new(config, automation, store, http_client);

    // One-shot mode: sweep the configured targets once and exit.
    if std::env::args().any(|a| a == "--once") {
        let targets = load_targets(&state.config.resolve_targets_path()).await?;
        let Some(guard) = state.try_begin_run() else {
            anyhow::bail!("a run is already in progress");
        };
        tokio::spawn(shutdown_signal(state.clone()));
        let artifact = state
            .spawn_run(targets, ProgressStreamer::unattended(), guard)
            .await?;
        println!("{}", artifact.metrics.summary());
        return Ok(());
    }

    if state.config.resolve_schedule_enabled() {
        tokio::spawn(Scheduler::from_state(&state).run(state.clone()));
    } else {
        info!("Scheduled sweeps disabled (set schedule_enabled or SCOUT_SCHEDULE=1).");
    }

    let app = server::router(state.clone());

    let port: u16 = parse_port_from_args()
        .or_else(port_from_env)
        .unwrap_or(5044);
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or run with --port {} (or set PORT/SCOUT_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("Occupancy scout listening on http://{}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.clone()))
    .await?;

    // Give an interrupted run the chance to close its pages and write its artifact.
    let grace = state.orchestrator.settings().cancel_grace * 2;
    if tokio::time::timeout(grace, wait_for_idle(&state)).await.is_err() {
        warn!("Active run did not stop in time; exiting anyway");
    }

    Ok(())
}

async fn wait_for_idle(state: &AppState) {
    while state.is_run_active() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

async fn shutdown_signal(state: AppState) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("🛑 Shutdown requested; cancelling scheduler and active run");
    state.shutdown.cancel();
}
