//! HTTP surface: streamed runs, latest results, location history, the
//! configured target list, health.

use crate::core::AppState;
use crate::features::access_log::access_log;
use crate::features::filters::{CallerPreferences, FilterInfo};
use crate::pipeline::progress::ProgressStreamer;
use crate::pipeline::targets::{load_targets, targets_from_urls};
use crate::types::{ErrorResponse, LocationHistoryRequest, RunArtifact, RunEvent, ScrapeRunRequest};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

const DEFAULT_HISTORY_HOURS: i64 = 12;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/scrape", post(scrape_handler))
        .route(
            "/latest-scraping",
            get(latest_scraping_handler).post(latest_scraping_filtered_handler),
        )
        .route("/location-history", post(location_history_handler))
        .route("/default-locations", get(default_locations_handler))
        .layer(middleware::from_fn_with_state(state.clone(), access_log))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn service_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "occupancy-scout",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /scrape": "start a run; streams NDJSON progress/result/complete/error events",
            "GET /latest-scraping": "latest run artifact",
            "POST /latest-scraping": "latest run artifact filtered by saved_urls and filters",
            "POST /location-history": "occupancy samples and opening hours for one location",
            "GET /default-locations": "the configured target list",
            "GET /health": "service health"
        }
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let storage = match &state.store {
        Some(store) if store.ping().await => "reachable",
        Some(_) => "unreachable",
        None => "disabled",
    };
    Json(serde_json::json!({
        "status": "healthy",
        "service": "occupancy-scout",
        "version": env!("CARGO_PKG_VERSION"),
        "orchestrator": {
            "automation_available": state.automation.is_available(),
            "run_in_progress": state.is_run_active(),
            "manual_runs_allowed": state.config.resolve_allow_manual_runs(),
        },
        "storage": storage,
    }))
}

async fn scrape_handler(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    if !state.config.resolve_allow_manual_runs() {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "manual runs are disabled; results are refreshed by the scheduler",
        ));
    }

    let request: ScrapeRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ScrapeRunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)))?
    };

    let targets = match request.urls {
        Some(urls) => targets_from_urls(urls),
        None => {
            let path = state.config.resolve_targets_path();
            load_targets(&path).await.map_err(|e| {
                error!("failed to load configured targets: {:#}", e);
                api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
            })?
        }
    };
    if targets.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "no valid https:// URLs to scrape",
        ));
    }

    let Some(guard) = state.try_begin_run() else {
        return Err(api_error(StatusCode::CONFLICT, "a run is already in progress"));
    };

    info!("🌐 manual run requested for {} target(s)", targets.len());
    let (tx, mut rx) = mpsc::channel::<RunEvent>(64);
    // Dropping the body (client gone) drops `rx`, which the run sees as a disconnect.
    state.spawn_run(targets, ProgressStreamer::new(tx), guard);

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<String, Infallible>(event.to_line());
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn latest_artifact(state: &AppState) -> Result<RunArtifact, ApiError> {
    match state.artifacts.latest().await {
        Ok(Some(artifact)) => Ok(artifact),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "no scraping data available yet")),
        Err(e) => {
            error!("failed to read latest artifact: {:#}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
        }
    }
}

async fn latest_scraping_handler(State(state): State<AppState>) -> Result<Json<RunArtifact>, ApiError> {
    latest_artifact(&state).await.map(Json)
}

#[derive(Debug, Serialize)]
pub struct FilteredArtifact {
    #[serde(flatten)]
    pub artifact: RunArtifact,
    pub filter_info: FilterInfo,
}

async fn latest_scraping_filtered_handler(
    State(state): State<AppState>,
    Json(preferences): Json<CallerPreferences>,
) -> Result<Json<FilteredArtifact>, ApiError> {
    let mut artifact = latest_artifact(&state).await?;
    let (results, filter_info) = preferences.apply(std::mem::take(&mut artifact.results));
    if filter_info.saved_locations > 0 && filter_info.after_saved_locations == 0 {
        warn!(
            "none of {} saved location(s) matched the latest run",
            filter_info.saved_locations
        );
    }
    artifact.results = results;
    Ok(Json(FilteredArtifact {
        artifact,
        filter_info,
    }))
}

/// One entry of the configured target list.
#[derive(Debug, Serialize)]
pub struct DefaultLocation {
    /// Always 1: invalid or duplicate entries are dropped while loading.
    #[serde(rename = "aktiv")]
    pub active: u8,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DefaultLocations {
    pub success: bool,
    pub locations: Vec<DefaultLocation>,
    pub count: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The scheduler's target list. A missing file is an empty list.
async fn default_locations_handler(
    State(state): State<AppState>,
) -> Result<Json<DefaultLocations>, ApiError> {
    let path = state.config.resolve_targets_path();
    let targets = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        load_targets(&path).await.map_err(|e| {
            error!("failed to load default locations: {:#}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        })?
    } else {
        warn!("no targets file at {}", path.display());
        Vec::new()
    };

    let locations: Vec<DefaultLocation> = targets
        .into_iter()
        .map(|t| DefaultLocation {
            active: 1,
            name: t.name,
            url: t.url,
        })
        .collect();
    Ok(Json(DefaultLocations {
        success: true,
        count: locations.len(),
        locations,
        timestamp: chrono::Utc::now(),
    }))
}

async fn location_history_handler(
    State(state): State<AppState>,
    Json(request): Json<LocationHistoryRequest>,
) -> Result<Response, ApiError> {
    let Some(store) = &state.store else {
        return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "storage is not configured"));
    };
    let hours = request.hours.unwrap_or(DEFAULT_HISTORY_HOURS);

    let history = match (request.location_id, request.url.as_deref()) {
        (Some(id), _) => store.location_history_by_id(id, hours).await,
        (None, Some(url)) if !url.trim().is_empty() => store.location_history(url.trim(), hours).await,
        _ => {
            return Err(api_error(StatusCode::BAD_REQUEST, "url or location_id is required"));
        }
    };

    match history {
        Ok(Some(history)) => Ok(Json(history).into_response()),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "location not found")),
        Err(e) => {
            error!("location history query failed: {:#}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "location history query failed"))
        }
    }
}
