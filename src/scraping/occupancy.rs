//! Best-effort parsing of free-form "popular times" text.
//!
//! Handles the German and English phrasings the map service renders, e.g.
//! `Derzeit zu 45 % ausgelastet; normal sind 60 %.` or
//! `Currently 45% busy, usually 60% busy.` Anything unparseable yields `None`.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

struct Patterns {
    current: Regex,
    current_single: Regex,
    usual: Regex,
    whitespace: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        current: Regex::new(r"(?i)(?:derzeit\s+zu|currently)\s+(\d{1,3})\s*%").expect("valid regex"),
        current_single: Regex::new(r"(?i)(\d{1,3})\s*%\s*(?:ausgelastet|busy)").expect("valid regex"),
        usual: Regex::new(r"(?i)(?:normal\s+sind|usually)\s+(\d{1,3})\s*%").expect("valid regex"),
        whitespace: Regex::new(r"\s+").expect("valid regex"),
    })
}

fn capture_percent(re: &Regex, text: &str) -> Option<u8> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|p| *p <= 100)
        .map(|p| p as u8)
}

/// Current and usual occupancy percentages parsed from one text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OccupancyReading {
    pub current: Option<u8>,
    pub usual: Option<u8>,
}

impl OccupancyReading {
    pub fn parse(text: &str) -> Self {
        let p = patterns();
        let current = capture_percent(&p.current, text).or_else(|| capture_percent(&p.current_single, text));
        let usual = capture_percent(&p.usual, text);
        Self { current, usual }
    }

    pub fn from_option(text: Option<&str>) -> Self {
        text.map(Self::parse).unwrap_or_default()
    }

    pub fn trend(&self) -> OccupancyTrend {
        let Some(current) = self.current else {
            return OccupancyTrend::NoData;
        };
        let Some(usual) = self.usual else {
            return match current {
                c if c > 70 => OccupancyTrend::High,
                c if c > 30 => OccupancyTrend::Medium,
                _ => OccupancyTrend::Low,
            };
        };
        let diff = current as i16 - usual as i16;
        match diff {
            d if d > 5 => OccupancyTrend::AboveUsual(d),
            d if d < -5 => OccupancyTrend::BelowUsual(d),
            d => OccupancyTrend::AroundUsual(d),
        }
    }
}

/// Coarse classification of a reading, relative to the usual level when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "difference", rename_all = "snake_case")]
pub enum OccupancyTrend {
    NoData,
    Low,
    Medium,
    High,
    AboveUsual(i16),
    BelowUsual(i16),
    AroundUsual(i16),
}

impl OccupancyTrend {
    pub fn label(&self) -> String {
        match self {
            OccupancyTrend::NoData => "no data".to_string(),
            OccupancyTrend::Low => "low".to_string(),
            OccupancyTrend::Medium => "medium".to_string(),
            OccupancyTrend::High => "high".to_string(),
            OccupancyTrend::AboveUsual(d) => format!("+{}% above usual", d),
            OccupancyTrend::BelowUsual(d) => format!("{}% below usual", d),
            OccupancyTrend::AroundUsual(d) => format!("±{}% of usual", d.abs()),
        }
    }
}

/// Whether `text` plausibly describes occupancy at all.
pub fn looks_like_occupancy(text: &str) -> bool {
    let t = text.trim();
    if t.chars().count() < 5 {
        return false;
    }
    let lower = t.to_lowercase();
    ["ausgelastet", "derzeit", "um ", "%", "live", "busy", "currently", "usually"]
        .iter()
        .any(|k| lower.contains(k))
}

/// Collapse whitespace and the HTML entities that leak through aria labels.
pub fn clean_occupancy_text(text: &str) -> String {
    let replaced = text.replace("&nbsp;", " ").replace('\u{a0}', " ").replace("&amp;", "&");
    patterns()
        .whitespace
        .replace_all(replaced.trim(), " ")
        .into_owned()
}
