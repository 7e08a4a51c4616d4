//! Caller-side views over a run's results: saved locations first, then filters (AND).

use crate::scraping::occupancy::OccupancyReading;
use crate::types::ScrapeResult;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::OnceLock;

/// One predicate over a result. Wire form: `{"type": "rating_min", "value": 4.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultFilter {
    LocationNameContains(String),
    LocationNameEquals(String),
    AddressContains(String),
    #[serde(deserialize_with = "lenient_f64")]
    RatingMin(f64),
    #[serde(deserialize_with = "lenient_f64")]
    OccupancyMin(f64),
    #[serde(deserialize_with = "lenient_f64")]
    OccupancyMax(f64),
    ExcludeLocation(String),
    #[serde(alias = "only_live_data", deserialize_with = "lenient_bool")]
    LiveOnly(bool),
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("number out of range")),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("not a number: {s}"))),
        other => Err(serde::de::Error::custom(format!("expected number, got {other}"))),
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) => Ok(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        )),
        serde_json::Value::Number(n) => Ok(n.as_i64() == Some(1)),
        other => Err(serde::de::Error::custom(format!("expected bool, got {other}"))),
    }
}

fn lower(v: &Option<String>) -> String {
    v.as_deref().unwrap_or_default().to_lowercase()
}

impl ResultFilter {
    pub fn matches(&self, result: &ScrapeResult) -> bool {
        match self {
            ResultFilter::LocationNameContains(v) => lower(&result.location_name).contains(&v.to_lowercase()),
            ResultFilter::LocationNameEquals(v) => lower(&result.location_name) == v.to_lowercase(),
            ResultFilter::AddressContains(v) => lower(&result.address).contains(&v.to_lowercase()),
            ResultFilter::RatingMin(min) => result.rating.unwrap_or(0.0) >= *min,
            ResultFilter::OccupancyMin(min) => occupancy_percent(result) >= *min,
            ResultFilter::OccupancyMax(max) => occupancy_percent(result) <= *max,
            ResultFilter::ExcludeLocation(v) => {
                let needle = v.to_lowercase();
                !(lower(&result.location_name).contains(&needle) || lower(&result.address).contains(&needle))
            }
            ResultFilter::LiveOnly(required) => !*required || result.is_live_data,
        }
    }
}

/// Current occupancy of a result; unparseable or missing text counts as 0.
fn occupancy_percent(result: &ScrapeResult) -> f64 {
    OccupancyReading::from_option(result.live_occupancy.as_deref())
        .current
        .map(f64::from)
        .unwrap_or(0.0)
}

/// Comparable identity of a place URL: the lowercased place name when present,
/// otherwise the URL up to the first `@` or `?`.
pub fn normalize_maps_url(url: &str) -> String {
    static PLACE: OnceLock<Regex> = OnceLock::new();
    let place = PLACE.get_or_init(|| Regex::new(r"/place/([^/@]+)").expect("valid regex"));
    if let Some(m) = place.captures(url).and_then(|c| c.get(1)) {
        let name = m.as_str().replace('+', " ");
        return percent_encoding::percent_decode_str(name.trim())
            .decode_utf8_lossy()
            .to_lowercase();
    }
    url.split('@')
        .next()
        .unwrap_or_default()
        .split('?')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerPreferences {
    #[serde(default)]
    pub saved_urls: Vec<String>,
    #[serde(default)]
    pub filters: Vec<ResultFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterInfo {
    pub total: usize,
    pub saved_locations: usize,
    pub after_saved_locations: usize,
    pub filters_applied: usize,
    pub after_filters: usize,
}

impl CallerPreferences {
    fn is_saved(&self, saved: &[String], result: &ScrapeResult) -> bool {
        let key = normalize_maps_url(&result.url);
        if key.is_empty() {
            return false;
        }
        saved
            .iter()
            .filter(|s| !s.is_empty())
            .any(|s| s.contains(&key) || key.contains(s.as_str()))
    }

    /// Keep saved locations (all when none are saved), then every filter must match.
    pub fn apply(&self, results: Vec<ScrapeResult>) -> (Vec<ScrapeResult>, FilterInfo) {
        let total = results.len();
        let saved: Vec<String> = self.saved_urls.iter().map(|u| normalize_maps_url(u)).collect();

        let scoped: Vec<ScrapeResult> = if saved.is_empty() {
            results
        } else {
            results.into_iter().filter(|r| self.is_saved(&saved, r)).collect()
        };
        let after_saved_locations = scoped.len();

        let kept: Vec<ScrapeResult> = scoped
            .into_iter()
            .filter(|r| self.filters.iter().all(|f| f.matches(r)))
            .collect();

        let info = FilterInfo {
            total,
            saved_locations: self.saved_urls.len(),
            after_saved_locations,
            filters_applied: self.filters.len(),
            after_filters: kept.len(),
        };
        (kept, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Target;

    fn result(name: &str, url: &str, rating: Option<f64>, occupancy: Option<&str>, live: bool) -> ScrapeResult {
        let mut r = ScrapeResult::failed(&Target::new(name, url), "", 1, 0);
        r.success = true;
        r.rating = rating;
        r.live_occupancy = occupancy.map(str::to_string);
        r.is_live_data = live;
        r.address = Some("Hauptstraße 5, Berlin".into());
        r
    }

    fn sample() -> Vec<ScrapeResult> {
        vec![
            result(
                "Club Nord",
                "https://www.google.com/maps/place/Club+Nord/@1,2",
                Some(4.5),
                Some("Derzeit zu 80 % ausgelastet"),
                true,
            ),
            result(
                "Bar Süd",
                "https://www.google.com/maps/place/Bar+S%C3%BCd/@3,4",
                Some(3.8),
                Some("Derzeit zu 20 % ausgelastet"),
                false,
            ),
            result("Café", "https://www.google.com/maps/place/Caf%C3%A9/@5,6", None, None, false),
        ]
    }

    #[test]
    fn filters_deserialize_leniently() {
        let prefs: CallerPreferences = serde_json::from_str(
            r#"{"filters": [
                {"type": "rating_min", "value": "4.0"},
                {"type": "only_live_data", "value": "true"},
                {"type": "occupancy_max", "value": 90}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            prefs.filters,
            vec![
                ResultFilter::RatingMin(4.0),
                ResultFilter::LiveOnly(true),
                ResultFilter::OccupancyMax(90.0)
            ]
        );
        let (kept, info) = prefs.apply(sample());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].location_name.as_deref(), Some("Club Nord"));
        assert_eq!(info.total, 3);
        assert_eq!(info.after_filters, 1);
    }

    #[test]
    fn saved_urls_scope_before_filters() {
        let prefs = CallerPreferences {
            saved_urls: vec![
                "https://www.google.com/maps/place/Bar+S%C3%BCd/@9,9,15z".into(),
                "https://www.google.com/maps/place/Caf%C3%A9".into(),
            ],
            filters: vec![ResultFilter::ExcludeLocation("café".into())],
        };
        let (kept, info) = prefs.apply(sample());
        assert_eq!(info.after_saved_locations, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].location_name.as_deref(), Some("Bar Süd"));
    }

    #[test]
    fn no_preferences_keeps_everything() {
        let (kept, info) = CallerPreferences::default().apply(sample());
        assert_eq!(kept.len(), 3);
        assert_eq!(info.after_saved_locations, 3);
    }

    #[test]
    fn occupancy_bounds_treat_missing_as_zero() {
        let results = sample();
        assert!(ResultFilter::OccupancyMin(50.0).matches(&results[0]));
        assert!(!ResultFilter::OccupancyMin(50.0).matches(&results[1]));
        assert!(ResultFilter::OccupancyMax(10.0).matches(&results[2]));
        assert!(ResultFilter::LocationNameEquals("club nord".into()).matches(&results[0]));
        assert!(ResultFilter::AddressContains("hauptstraße".into()).matches(&results[1]));
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_maps_url("https://www.google.com/maps/place/Bar+S%C3%BCd/@3,4"),
            "bar süd"
        );
        assert_eq!(normalize_maps_url("https://Example.com/x?y=1"), "https://example.com/x");
    }
}
