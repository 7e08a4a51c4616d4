//! Static resource-blocking policy applied to every leased page.
//!
//! Two layers: a substring deny list of ad / analytics / tracker hosts
//! (Aho-Corasick, linear-time scan) and, optionally, asset extensions
//! (images, stylesheets, fonts) that the occupancy extractor never needs.
//! The browser backend asks [`BlockPolicy::blocks_request`] for every request
//! a tab makes.

use aho_corasick::AhoCorasick;
use std::sync::Arc;

const TRACKER_PATTERNS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "googletagmanager.com",
    "googletagservices.com",
    "google-analytics.com",
    "analytics.google.com",
    "adservice.google.",
    "amazon-adsystem.com",
    "/ads/",
    "/analytics/",
    "/gtm/",
    "connect.facebook.net",
    "facebook.com/tr",
    "platform.twitter.com/widgets",
    "hotjar.com",
    "criteo.com",
    "taboola.com",
    "outbrain.com",
    "adnxs.com",
    "cookielaw.org",
    "cookiebot.com",
];

const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".css", ".scss", ".less", ".woff",
    ".woff2", ".ttf", ".otf", ".eot",
];

/// CDP resource types dropped when assets are blocked.
const ASSET_RESOURCE_TYPES: &[&str] = &["image", "stylesheet", "font", "media"];

#[derive(Clone)]
pub struct BlockPolicy {
    patterns: Vec<String>,
    matcher: Option<Arc<AhoCorasick>>,
    block_assets: bool,
}

impl std::fmt::Debug for BlockPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPolicy")
            .field("patterns", &self.patterns.len())
            .field("block_assets", &self.block_assets)
            .finish()
    }
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self::new(&[], true)
    }
}

impl BlockPolicy {
    /// Built-in tracker list plus `extra` substrings.
    pub fn new(extra: &[String], block_assets: bool) -> Self {
        let patterns: Vec<String> = TRACKER_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(
                extra
                    .iter()
                    .map(|p| p.trim().to_ascii_lowercase())
                    .filter(|p| !p.is_empty()),
            )
            .collect();

        let matcher = match AhoCorasick::new(&patterns) {
            Ok(m) => Some(Arc::new(m)),
            Err(e) => {
                tracing::warn!("block policy: invalid deny list ({}), tracker blocking disabled", e);
                None
            }
        };

        Self {
            patterns,
            matcher,
            block_assets,
        }
    }

    pub fn blocks_url(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        if self.matcher.as_ref().is_some_and(|m| m.is_match(&lower)) {
            return true;
        }
        if self.block_assets {
            let path = lower.split(['?', '#']).next().unwrap_or(&lower);
            return ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext));
        }
        false
    }

    pub fn blocks_resource_type(&self, resource_type: &str) -> bool {
        self.block_assets
            && ASSET_RESOURCE_TYPES
                .iter()
                .any(|t| resource_type.eq_ignore_ascii_case(t))
    }

    /// Decision for one intercepted request. `resource_type` is the CDP name
    /// (`Image`, `Stylesheet`, ...), matched case-insensitively.
    pub fn blocks_request(&self, url: &str, resource_type: &str) -> bool {
        self.blocks_resource_type(resource_type) || self.blocks_url(url)
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}
