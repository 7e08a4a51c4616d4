//! Durable locations, occupancy samples and opening hours (SQLite via sqlx).
//!
//! Samples are keyed by `(location_id, timestamp_ms)`; re-persisting the same
//! result is a no-op, which makes artifact re-import idempotent. Opening hours
//! keep one row per location and weekday, overwritten by newer readings.

use crate::scraping::extract::name_from_url;
use crate::scraping::occupancy::OccupancyReading;
use crate::scraping::opening_hours::OpeningHours;
use crate::types::ScrapeResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS locations (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT,
        address     TEXT,
        url         TEXT NOT NULL UNIQUE,
        rating      REAL,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS occupancy_samples (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        location_id        INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
        occupancy_percent  INTEGER,
        usual_percent      INTEGER,
        occupancy_text     TEXT,
        is_live_data       INTEGER NOT NULL DEFAULT 0,
        timestamp_ms       INTEGER NOT NULL,
        UNIQUE (location_id, timestamp_ms)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS opening_hours (
        location_id  INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
        weekday      INTEGER NOT NULL CHECK (weekday BETWEEN 0 AND 6),
        open_time    TEXT,
        close_time   TEXT,
        is_closed    INTEGER NOT NULL DEFAULT 0,
        is_24h       INTEGER NOT NULL DEFAULT 0,
        raw_text     TEXT,
        confidence   REAL NOT NULL,
        updated_at   INTEGER NOT NULL,
        PRIMARY KEY (location_id, weekday)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_samples_location_time ON occupancy_samples (location_id, timestamp_ms)",
    "CREATE INDEX IF NOT EXISTS idx_locations_name ON locations (name COLLATE NOCASE)",
];

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRow {
    pub id: i64,
    pub name: Option<String>,
    pub address: Option<String>,
    pub url: String,
    pub rating: Option<f64>,
}

type LocationTuple = (i64, Option<String>, Option<String>, String, Option<f64>);

impl From<LocationTuple> for LocationRow {
    fn from((id, name, address, url, rating): LocationTuple) -> Self {
        Self {
            id,
            name,
            address,
            url,
            rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRow {
    pub occupancy_percent: Option<i64>,
    pub usual_percent: Option<i64>,
    pub occupancy_text: Option<String>,
    pub is_live_data: bool,
    pub timestamp: DateTime<Utc>,
    /// Human-readable comparison against the usual level.
    pub trend: String,
}

/// Stored opening hours for one weekday (0 = Sunday).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpeningHoursRow {
    pub weekday: i64,
    pub open_time: Option<String>,
    pub close_time: Option<String>,
    pub is_closed: bool,
    pub is_24h: bool,
    pub raw_text: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationHistory {
    pub location: LocationRow,
    pub hours: i64,
    pub samples: Vec<SampleRow>,
    pub opening_hours: Vec<OpeningHoursRow>,
}

/// Sample fields ready for insertion.
#[derive(Debug, Clone, Default)]
pub struct NewSample {
    pub occupancy_percent: Option<u8>,
    pub usual_percent: Option<u8>,
    pub occupancy_text: Option<String>,
    pub is_live_data: bool,
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OccupancyStore {
    pool: SqlitePool,
}

impl OccupancyStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url: {}", url))?
            .create_if_missing(true)
            .foreign_keys(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database {}", url))?;

        let store = Self { pool };
        store.migrate().await?;
        info!("🗄️ occupancy store ready ({})", url);
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("schema migration failed")?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Insert an unseen location, or fill in fields that are still null.
    ///
    /// A stored name or address is never replaced; empty strings count as null.
    pub async fn upsert_location(
        &self,
        url: &str,
        name: Option<&str>,
        address: Option<&str>,
        rating: Option<f64>,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let (id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO locations (name, address, url, rating, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?5)
               ON CONFLICT(url) DO UPDATE SET
                   name       = COALESCE(NULLIF(locations.name, ''), excluded.name),
                   address    = COALESCE(NULLIF(locations.address, ''), excluded.address),
                   rating     = COALESCE(excluded.rating, locations.rating),
                   updated_at = excluded.updated_at
               RETURNING id"#,
        )
        .bind(non_empty(name))
        .bind(non_empty(address))
        .bind(url)
        .bind(rating)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to upsert location {}", url))?;
        Ok(id)
    }

    /// `false` when a sample with the same `(location_id, timestamp)` already exists.
    pub async fn insert_sample_if_absent(
        &self,
        location_id: i64,
        timestamp: DateTime<Utc>,
        sample: &NewSample,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"INSERT INTO occupancy_samples
                   (location_id, occupancy_percent, usual_percent, occupancy_text, is_live_data, timestamp_ms)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)
               ON CONFLICT(location_id, timestamp_ms) DO NOTHING"#,
        )
        .bind(location_id)
        .bind(sample.occupancy_percent.map(i64::from))
        .bind(sample.usual_percent.map(i64::from))
        .bind(sample.occupancy_text.as_deref())
        .bind(sample.is_live_data)
        .bind(timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("failed to insert occupancy sample")?;
        Ok(done.rows_affected() == 1)
    }

    /// Persist one successful result. Returns whether a new sample row was written;
    /// failed results are skipped.
    pub async fn persist_result(&self, result: &ScrapeResult) -> Result<bool> {
        if !result.success {
            return Ok(false);
        }
        let location_id = self
            .upsert_location(
                &result.url,
                result.location_name.as_deref(),
                result.address.as_deref(),
                result.rating,
            )
            .await?;

        let reading = OccupancyReading::from_option(result.live_occupancy.as_deref());
        let sample = NewSample {
            occupancy_percent: reading.current,
            usual_percent: reading.usual,
            occupancy_text: result.live_occupancy.clone(),
            is_live_data: result.is_live_data,
        };
        let inserted = self
            .insert_sample_if_absent(location_id, result.timestamp, &sample)
            .await?;
        if !inserted {
            debug!("duplicate sample skipped for {} @ {}", result.url, result.timestamp);
        }

        let hours = OpeningHours::from_option(result.live_occupancy.as_deref());
        if hours.is_confident() {
            let weekday = result
                .timestamp
                .with_timezone(&Local)
                .weekday()
                .num_days_from_sunday();
            self.upsert_opening_hours(location_id, weekday, &hours).await?;
            debug!(
                "💡 opening hours for {}: {} (confidence {:.2})",
                result.location_name.as_deref().unwrap_or(&result.url),
                if hours.is_open == Some(true) { "open" } else { "closed" },
                hours.confidence
            );
        }
        Ok(inserted)
    }

    /// Replace the stored reading for `(location_id, weekday)`; 0 = Sunday.
    pub async fn upsert_opening_hours(
        &self,
        location_id: i64,
        weekday: u32,
        hours: &OpeningHours,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO opening_hours
                   (location_id, weekday, open_time, close_time, is_closed, is_24h, raw_text, confidence, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(location_id, weekday) DO UPDATE SET
                   open_time  = excluded.open_time,
                   close_time = excluded.close_time,
                   is_closed  = excluded.is_closed,
                   is_24h     = excluded.is_24h,
                   raw_text   = excluded.raw_text,
                   confidence = excluded.confidence,
                   updated_at = excluded.updated_at"#,
        )
        .bind(location_id)
        .bind(i64::from(weekday))
        .bind(hours.open_time.as_deref())
        .bind(hours.close_time.as_deref())
        .bind(hours.is_closed)
        .bind(hours.is_24h)
        .bind(non_empty(Some(hours.raw_text.as_str())))
        .bind(hours.confidence)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store opening hours for location {}", location_id))?;
        Ok(())
    }

    /// Stored opening hours of a location, Sunday first.
    pub async fn opening_hours(&self, location_id: i64) -> Result<Vec<OpeningHoursRow>> {
        let rows: Vec<(i64, Option<String>, Option<String>, bool, bool, Option<String>, f64)> =
            sqlx::query_as(
                r#"SELECT weekday, open_time, close_time, is_closed, is_24h, raw_text, confidence
                   FROM opening_hours WHERE location_id = ?1 ORDER BY weekday"#,
            )
            .bind(location_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(weekday, open_time, close_time, is_closed, is_24h, raw_text, confidence)| OpeningHoursRow {
                    weekday,
                    open_time,
                    close_time,
                    is_closed,
                    is_24h,
                    raw_text,
                    confidence,
                },
            )
            .collect())
    }

    pub async fn location_by_url(&self, url: &str) -> Result<Option<LocationRow>> {
        let row: Option<LocationTuple> =
            sqlx::query_as("SELECT id, name, address, url, rating FROM locations WHERE url = ?1")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(LocationRow::from))
    }

    pub async fn location_by_id(&self, id: i64) -> Result<Option<LocationRow>> {
        let row: Option<LocationTuple> =
            sqlx::query_as("SELECT id, name, address, url, rating FROM locations WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(LocationRow::from))
    }

    async fn location_by_name(&self, name: &str) -> Result<Option<LocationRow>> {
        let row: Option<LocationTuple> = sqlx::query_as(
            r#"SELECT id, name, address, url, rating FROM locations
               WHERE name = ?1 COLLATE NOCASE
               ORDER BY updated_at DESC LIMIT 1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LocationRow::from))
    }

    pub async fn samples_since(&self, location_id: i64, since: DateTime<Utc>) -> Result<Vec<SampleRow>> {
        let rows: Vec<(Option<i64>, Option<i64>, Option<String>, bool, i64)> = sqlx::query_as(
            r#"SELECT occupancy_percent, usual_percent, occupancy_text, is_live_data, timestamp_ms
               FROM occupancy_samples
               WHERE location_id = ?1 AND timestamp_ms >= ?2
               ORDER BY timestamp_ms ASC"#,
        )
        .bind(location_id)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(current, usual, text, is_live, ts)| {
                let timestamp = DateTime::<Utc>::from_timestamp_millis(ts)?;
                let reading = OccupancyReading {
                    current: current.and_then(|v| u8::try_from(v).ok()),
                    usual: usual.and_then(|v| u8::try_from(v).ok()),
                };
                Some(SampleRow {
                    occupancy_percent: current,
                    usual_percent: usual,
                    occupancy_text: text,
                    is_live_data: is_live,
                    timestamp,
                    trend: reading.trend().label(),
                })
            })
            .collect())
    }

    pub async fn sample_count(&self, location_id: i64) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM occupancy_samples WHERE location_id = ?1")
            .bind(location_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Samples of the last `hours` for `url`. When the exact URL is unknown the
    /// place name parsed from it is tried instead.
    pub async fn location_history(&self, url: &str, hours: i64) -> Result<Option<LocationHistory>> {
        let mut location = self.location_by_url(url).await?;
        if location.is_none() {
            if let Some(name) = name_from_url(url) {
                location = self.location_by_name(&name).await?;
            }
        }
        match location {
            Some(location) => self.history_for(location, hours).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn location_history_by_id(&self, id: i64, hours: i64) -> Result<Option<LocationHistory>> {
        match self.location_by_id(id).await? {
            Some(location) => self.history_for(location, hours).await.map(Some),
            None => Ok(None),
        }
    }

    async fn history_for(&self, location: LocationRow, hours: i64) -> Result<LocationHistory> {
        let hours = hours.clamp(1, 24 * 30);
        let since = Utc::now() - ChronoDuration::hours(hours);
        let samples = self.samples_since(location.id, since).await?;
        let opening_hours = self.opening_hours(location.id).await?;
        Ok(LocationHistory {
            location,
            hours,
            samples,
            opening_hours,
        })
    }
}
