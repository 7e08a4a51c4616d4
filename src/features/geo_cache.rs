//! IP → (country, city) lookups for the access log.
//!
//! Entries live for the whole process; there is no eviction. Failed lookups
//! are not cached so a transient API error does not stick.

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_ENDPOINT: &str = "https://ipapi.co";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
}

impl GeoInfo {
    pub fn new(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            city: city.into(),
        }
    }

    pub fn local() -> Self {
        Self::new("Local", "Local")
    }

    pub fn unknown() -> Self {
        Self::new("unknown", "unknown")
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

/// Loopback, private, link-local and unparseable addresses never leave the host.
pub fn is_local_ip(ip: &str) -> bool {
    let trimmed = ip.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") || trimmed.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        Ok(IpAddr::V6(v6)) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
        Err(_) => true,
    }
}

#[derive(Clone)]
pub struct GeoCache {
    cache: Cache<String, GeoInfo>,
    client: reqwest::Client,
    endpoint: String,
    enabled: bool,
}

impl std::fmt::Debug for GeoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoCache")
            .field("entries", &self.cache.entry_count())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl GeoCache {
    pub fn new(client: reqwest::Client, enabled: bool) -> Self {
        Self {
            cache: Cache::builder().build(),
            client,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            enabled,
        }
    }

    /// Cache-only instance; misses resolve to "unknown".
    pub fn offline() -> Self {
        Self::new(reqwest::Client::new(), false)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn insert(&self, ip: &str, info: GeoInfo) {
        self.cache.insert(ip.to_string(), info).await;
    }

    pub async fn lookup(&self, ip: &str) -> GeoInfo {
        if is_local_ip(ip) {
            return GeoInfo::local();
        }
        if let Some(hit) = self.cache.get(ip).await {
            return hit;
        }
        if !self.enabled {
            return GeoInfo::unknown();
        }
        match self.fetch(ip).await {
            Some(info) => {
                self.cache.insert(ip.to_string(), info.clone()).await;
                info
            }
            None => GeoInfo::unknown(),
        }
    }

    async fn fetch(&self, ip: &str) -> Option<GeoInfo> {
        let url = format!("{}/{}/json/", self.endpoint, ip);
        let response = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("geolocation lookup failed for {}: {}", ip, e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!("geolocation API returned {} for {}", response.status(), ip);
            return None;
        }
        let body: IpApiResponse = response.json().await.ok()?;
        debug!("geolocation resolved for {}", ip);
        Some(GeoInfo::new(
            body.country_name.unwrap_or_else(|| "unknown".into()),
            body.city.unwrap_or_else(|| "unknown".into()),
        ))
    }
}
