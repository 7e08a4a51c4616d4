//! Target loading and normalization.
//!
//! Accepted inputs: a JSON array of `{ "name"?, "url" }` objects or plain URL
//! strings, or a text file with one URL per line (`#` comments allowed).

use crate::scraping::extract::name_from_url;
use crate::types::Target;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Url(String),
    Full {
        #[serde(default)]
        name: Option<String>,
        url: String,
    },
}

/// `true` for absolute `https://` URLs with a host.
pub fn is_valid_target_url(raw: &str) -> bool {
    url::Url::parse(raw.trim())
        .map(|u| u.scheme() == "https" && u.host_str().is_some())
        .unwrap_or(false)
}

/// Validate, dedupe (first occurrence wins) and name raw `(name, url)` pairs.
///
/// Names default to the place name in the URL, then to `Location {n}`.
pub fn normalize_targets<I>(entries: I) -> Vec<Target>
where
    I: IntoIterator<Item = (Option<String>, String)>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (name, url) in entries {
        let url = url.trim().to_string();
        if !is_valid_target_url(&url) {
            warn!("skipping invalid target URL: {}", url);
            continue;
        }
        if !seen.insert(url.clone()) {
            continue;
        }
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or_else(|| name_from_url(&url))
            .unwrap_or_else(|| format!("Location {}", out.len() + 1));
        out.push(Target::new(name, url));
    }
    out
}

/// Targets from a bare URL list (the `POST /scrape` body).
pub fn targets_from_urls(urls: Vec<String>) -> Vec<Target> {
    normalize_targets(urls.into_iter().map(|u| (None, u)))
}

pub fn parse_targets(contents: &str) -> Result<Vec<Target>> {
    let trimmed = contents.trim_start();
    let entries: Vec<(Option<String>, String)> = if trimmed.starts_with('[') {
        let parsed: Vec<TargetEntry> =
            serde_json::from_str(trimmed).context("targets file is not a valid JSON array")?;
        parsed
            .into_iter()
            .map(|e| match e {
                TargetEntry::Url(url) => (None, url),
                TargetEntry::Full { name, url } => (name, url),
            })
            .collect()
    } else {
        contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| (None, l.to_string()))
            .collect()
    };
    Ok(normalize_targets(entries))
}

pub async fn load_targets(path: &Path) -> Result<Vec<Target>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read targets from {}", path.display()))?;
    let targets = parse_targets(&contents)?;
    info!("📋 loaded {} target(s) from {}", targets.len(), path.display());
    Ok(targets)
}
