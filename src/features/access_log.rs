//! Per-request access log with client geolocation.

use crate::core::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use tracing::info;

/// First address of `X-Forwarded-For`, then `CF-Connecting-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
            return strip_port(first);
        }
    }
    if let Some(cf) = header("cf-connecting-ip") {
        return cf.to_string();
    }
    peer.map(|p| p.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `1.2.3.4:5678` → `1.2.3.4`; IPv6 literals are left alone.
fn strip_port(raw: &str) -> String {
    if raw.matches(':').count() == 1 {
        return raw.split(':').next().unwrap_or(raw).to_string();
    }
    raw.trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(raw)
        .to_string()
}

pub async fn access_log(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let headers = req.headers();
    let ip = client_ip(headers, peer);
    let endpoint = format!("{} {}", req.method(), req.uri().path());
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let cf_country = headers
        .get("cf-ipcountry")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|c| !c.is_empty() && c != "unknown");
    let cf_city = headers
        .get("cf-ipcity")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = next.run(req).await;
    let status = response.status().as_u16();

    // Resolve off the request path; the lookup may hit the network.
    let geo = state.geo.clone();
    tokio::spawn(async move {
        let (country, city) = match cf_country {
            Some(country) => (country, cf_city.unwrap_or_else(|| "unknown".into())),
            None => {
                let info = geo.lookup(&ip).await;
                (info.country, info.city)
            }
        };
        info!(
            target: "access",
            "📊 {} ({}, {}) -> {} [{}] {}",
            ip, country, city, endpoint, status, user_agent
        );
    });

    response
}
