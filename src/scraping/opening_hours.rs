//! Open/closed state inferred from the same live-status text the occupancy
//! parser reads, e.g. `Geöffnet bis 02:00` or `Geschlossen · Öffnet um 18:00`.
//!
//! Each reading carries a confidence; callers only persist readings at or
//! above [`OpeningHours::PERSIST_THRESHOLD`].

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

struct Patterns {
    open_until: Regex,
    closed_opens_at: Regex,
    all_day: Regex,
    forecast: Regex,
    currently_busy: Regex,
    closed: Regex,
    open: Regex,
}

static PATTERNS: OnceLock<Patterns> = OnceLock::new();

fn patterns() -> &'static Patterns {
    PATTERNS.get_or_init(|| Patterns {
        open_until: Regex::new(r"Geöffnet bis (\d{1,2}):(\d{2})").expect("valid regex"),
        closed_opens_at: Regex::new(r"Geschlossen.*?[Öö]ffnet um (\d{1,2}):(\d{2})").expect("valid regex"),
        all_day: Regex::new(r"(?i)24\s*Stunden?\s*geöffnet").expect("valid regex"),
        forecast: Regex::new(r"Um (\d{1,2}):(\d{2}) Uhr zu (\d+)\s*%.*ausgelastet").expect("valid regex"),
        currently_busy: Regex::new(r"Derzeit zu \d+\s*%.*ausgelastet").expect("valid regex"),
        closed: Regex::new(r"\bGeschlossen\b").expect("valid regex"),
        open: Regex::new(r"\bGeöffnet\b").expect("valid regex"),
    })
}

fn clock(hour: &str, minute: &str) -> Option<String> {
    let hour: u8 = hour.parse().ok()?;
    Some(format!("{:02}:{}", hour, minute))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpeningHours {
    /// `None` when the text says nothing either way.
    pub is_open: Option<bool>,
    pub is_closed: bool,
    pub is_24h: bool,
    /// `HH:MM`
    pub open_time: Option<String>,
    /// `HH:MM`
    pub close_time: Option<String>,
    pub confidence: f64,
    pub raw_text: String,
}

impl OpeningHours {
    pub const PERSIST_THRESHOLD: f64 = 0.5;

    /// First matching phrasing wins; order is most to least specific.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let mut hours = Self {
            raw_text: text.to_string(),
            ..Default::default()
        };
        if text.is_empty() {
            return hours;
        }
        let p = patterns();

        if let Some(c) = p.open_until.captures(text) {
            hours.is_open = Some(true);
            hours.close_time = clock(&c[1], &c[2]);
            hours.confidence = 0.9;
        } else if let Some(c) = p.closed_opens_at.captures(text) {
            hours.is_open = Some(false);
            hours.is_closed = true;
            hours.open_time = clock(&c[1], &c[2]);
            hours.confidence = 0.9;
        } else if p.all_day.is_match(text) {
            hours.is_open = Some(true);
            hours.is_24h = true;
            hours.confidence = 0.95;
        } else if let Some(c) = p.forecast.captures(text) {
            let hour: u32 = c[1].parse().unwrap_or(12);
            let percent: u32 = c[3].parse().unwrap_or(1);
            // An empty forecast in the small hours usually means the place is shut.
            if percent == 0 && !(6..=22).contains(&hour) {
                hours.is_open = Some(false);
                hours.is_closed = true;
                hours.confidence = 0.7;
            } else {
                hours.is_open = Some(true);
                hours.confidence = 0.6;
            }
        } else if p.currently_busy.is_match(text) {
            hours.is_open = Some(true);
            hours.confidence = 0.8;
        } else if p.closed.is_match(text) {
            hours.is_open = Some(false);
            hours.is_closed = true;
            hours.confidence = 0.8;
        } else if p.open.is_match(text) {
            hours.is_open = Some(true);
            hours.confidence = 0.7;
        } else if text.chars().count() > 5 {
            hours.confidence = 0.1;
        }
        hours
    }

    pub fn from_option(text: Option<&str>) -> Self {
        text.map(Self::parse).unwrap_or_default()
    }

    pub fn is_confident(&self) -> bool {
        self.confidence >= Self::PERSIST_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_until_and_opens_at() {
        let open = OpeningHours::parse("Geöffnet bis 2:00 · Derzeit zu 40 % ausgelastet");
        assert_eq!(open.is_open, Some(true));
        assert_eq!(open.close_time.as_deref(), Some("02:00"));
        assert_eq!(open.confidence, 0.9);

        let closed = OpeningHours::parse("Geschlossen · Öffnet um 18:30");
        assert_eq!(closed.is_open, Some(false));
        assert!(closed.is_closed);
        assert_eq!(closed.open_time.as_deref(), Some("18:30"));
        assert!(closed.close_time.is_none());
    }

    #[test]
    fn round_the_clock() {
        let hours = OpeningHours::parse("24 Stunden GEÖFFNET");
        assert!(hours.is_24h);
        assert_eq!(hours.is_open, Some(true));
        assert_eq!(hours.confidence, 0.95);
    }

    #[test]
    fn empty_forecast_at_night_reads_as_closed() {
        let night = OpeningHours::parse("Um 4:00 Uhr zu 0 % ausgelastet.");
        assert_eq!(night.is_open, Some(false));
        assert_eq!(night.confidence, 0.7);

        let evening = OpeningHours::parse("Um 20:00 Uhr zu 0 % ausgelastet.");
        assert_eq!(evening.is_open, Some(true));
        assert_eq!(evening.confidence, 0.6);

        let busy_night = OpeningHours::parse("Um 23:00 Uhr zu 65 % ausgelastet.");
        assert_eq!(busy_night.is_open, Some(true));
    }

    #[test]
    fn generic_phrasings_and_confidence_floor() {
        assert_eq!(
            OpeningHours::parse("Derzeit zu 45 % ausgelastet; normal sind 60 %.").confidence,
            0.8
        );
        assert!(OpeningHours::parse("Vorübergehend Geschlossen").is_closed);
        assert_eq!(OpeningHours::parse("Jetzt Geöffnet").is_open, Some(true));

        let unknown = OpeningHours::parse("Live-Daten nicht verfügbar");
        assert_eq!(unknown.is_open, None);
        assert_eq!(unknown.confidence, 0.1);
        assert!(!unknown.is_confident());

        let blank = OpeningHours::from_option(None);
        assert_eq!(blank.confidence, 0.0);
        assert!(blank.raw_text.is_empty());
    }
}
