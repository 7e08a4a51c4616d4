//! Field extraction from a rendered place page.
//!
//! Every field is best-effort; a missing selector simply leaves the field empty.
//! Whether the page counted as scraped is decided by `RawExtraction::has_signal`.

use crate::scraping::occupancy::{clean_occupancy_text, looks_like_occupancy};
use crate::types::RawExtraction;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;

const NAME_SELECTORS: &[&str] = &[
    "h1[data-attrid=\"title\"]",
    "h1.DUwDvf",
    "[data-value=\"Ort\"]",
    "h1",
];

const ADDRESS_SELECTORS: &[&str] = &[
    "button[data-item-id=\"address\"]",
    "[data-item-id=\"address\"]",
];

const RATING_SELECTORS: &[&str] = &[
    "[data-value=\"Bewertungen\"]",
    "span[role=\"img\"][aria-label*=\"Sterne\"]",
    "span[role=\"img\"][aria-label*=\"stars\"]",
    "div.F7nice span[aria-hidden=\"true\"]",
];

/// Live readings carry one of these in their aria label, checked in order.
const OCCUPANCY_LABEL_SELECTORS: &[&str] = &[
    "[aria-label*=\"Derzeit\"]",
    "[aria-label*=\"derzeit\"]",
    "[aria-label*=\"Currently\"]",
    "[aria-label*=\"currently\"]",
    "[aria-label*=\"ausgelastet\"]",
    "[aria-label*=\"busy\"]",
];

struct Patterns {
    rating: Regex,
    live_status: Regex,
    place_segment: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        rating: Regex::new(r"(\d+[,.]\d+)").expect("valid regex"),
        live_status: Regex::new(r"(?i)>Live</[^>]*>\s*<[^>]*>([^<]+)").expect("valid regex"),
        place_segment: Regex::new(r"/place/([^/@?]+)").expect("valid regex"),
    })
}

/// Pull every known field out of a rendered page.
pub fn extract_place(html: &str) -> RawExtraction {
    let document = Html::parse_document(html);
    let is_live = html.contains(">Live<");

    let mut occupancy_text = extract_occupancy_label(&document);
    if occupancy_text.is_none() && is_live {
        occupancy_text = patterns()
            .live_status
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| clean_occupancy_text(m.as_str()))
            .filter(|s| !s.is_empty())
            .map(|status| format!("Live: {}", status));
    }

    RawExtraction {
        name: extract_name(&document),
        address: extract_address(&document),
        rating: extract_rating(&document),
        occupancy_text,
        is_live,
    }
}

fn first_text(document: &Html, selectors: &[&str]) -> Option<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = element.text().collect::<Vec<_>>().join(" ");
            let text = clean_occupancy_text(&text);
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_name(document: &Html) -> Option<String> {
    first_text(document, NAME_SELECTORS)
}

fn extract_address(document: &Html) -> Option<String> {
    for raw in ADDRESS_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(el) = document.select(&selector).next() {
            if let Some(label) = el.value().attr("aria-label") {
                // "Adresse: Musterstraße 1" / "Address: 1 Main St"
                let value = label.split_once(':').map(|(_, v)| v).unwrap_or(label).trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
            let text = clean_occupancy_text(&el.text().collect::<Vec<_>>().join(" "));
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_rating(document: &Html) -> Option<f64> {
    for raw in RATING_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for el in document.select(&selector) {
            let source = el
                .value()
                .attr("aria-label")
                .map(str::to_string)
                .unwrap_or_else(|| el.text().collect::<String>());
            if let Some(rating) = parse_rating(&source) {
                return Some(rating);
            }
        }
    }
    None
}

/// `"4,5 Sterne"` / `"4.5 stars"` → `4.5`. Values outside `0..=5` are rejected.
pub fn parse_rating(text: &str) -> Option<f64> {
    patterns()
        .rating
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
        .filter(|r| (0.0..=5.0).contains(r))
}

fn extract_occupancy_label(document: &Html) -> Option<String> {
    for raw in OCCUPANCY_LABEL_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for el in document.select(&selector) {
            let Some(label) = el.value().attr("aria-label") else {
                continue;
            };
            let cleaned = clean_occupancy_text(label);
            if looks_like_occupancy(&cleaned) {
                return Some(cleaned);
            }
        }
    }
    None
}

/// Display name derived from a place URL, used when no name was supplied.
///
/// `https://www.google.com/maps/place/Caf%C3%A9+Central/@52.5,...` → `Café Central`.
pub fn name_from_url(url: &str) -> Option<String> {
    let segment = patterns()
        .place_segment
        .captures(url)
        .and_then(|c| c.get(1))?
        .as_str()
        .replace('+', " ");
    let decoded = percent_encoding::percent_decode_str(&segment)
        .decode_utf8_lossy()
        .trim()
        .to_string();
    (!decoded.is_empty()).then_some(decoded)
}
