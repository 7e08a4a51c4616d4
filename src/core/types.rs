use crate::scraping::extract::name_from_url;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A place to sample. The canonical URL is the identity key.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub url: String,
}

impl Target {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// One attempt-able unit of work.
#[derive(Debug, Clone)]
pub struct ScrapeTask {
    pub target: Target,
    pub batch_id: usize,
    /// Attempts started so far; never exceeds `max_retries + 1`.
    pub attempts: u32,
}

/// Ordered group of tasks scheduled together.
#[derive(Debug, Clone)]
pub struct Batch {
    /// 1-based, in submission order.
    pub id: usize,
    pub tasks: Vec<ScrapeTask>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Raw field values pulled out of a rendered page. Every field is best-effort.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RawExtraction {
    pub name: Option<String>,
    pub address: Option<String>,
    pub rating: Option<f64>,
    pub occupancy_text: Option<String>,
    pub is_live: bool,
}

impl RawExtraction {
    /// A page counts as scraped when it produced a name or an occupancy reading.
    pub fn has_signal(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.name) || present(&self.occupancy_text)
    }
}

/// Outcome of one task, produced exactly once (possibly after retries).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScrapeResult {
    pub location_name: Option<String>,
    pub address: Option<String>,
    pub rating: Option<f64>,
    pub live_occupancy: Option<String>,
    pub is_live_data: bool,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
    pub retries_used: u32,
}

impl ScrapeResult {
    /// Successful result built from an extraction; the target name fills a missing page name.
    pub fn scraped(target: &Target, raw: RawExtraction, processing_time_ms: u64, retries_used: u32) -> Self {
        Self {
            location_name: raw
                .name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| fallback_name(target)),
            address: raw.address,
            rating: raw.rating,
            live_occupancy: raw.occupancy_text,
            is_live_data: raw.is_live,
            url: target.url.clone(),
            timestamp: Utc::now(),
            success: true,
            error: None,
            processing_time_ms,
            retries_used,
        }
    }

    /// Failed result carrying only the cheap fallback name.
    pub fn failed(
        target: &Target,
        error: impl Into<String>,
        processing_time_ms: u64,
        retries_used: u32,
    ) -> Self {
        Self {
            location_name: fallback_name(target),
            address: None,
            rating: None,
            live_occupancy: None,
            is_live_data: false,
            url: target.url.clone(),
            timestamp: Utc::now(),
            success: false,
            error: Some(error.into()),
            processing_time_ms,
            retries_used,
        }
    }
}

fn fallback_name(target: &Target) -> Option<String> {
    Some(target.name.trim().to_string())
        .filter(|n| !n.is_empty())
        .or_else(|| name_from_url(&target.url))
}

/// End-of-run statistics.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RunMetrics {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage in `0.0..=100.0`.
    pub success_rate: f64,
    pub run_time_ms: u64,
    pub avg_processing_ms: f64,
    pub median_processing_ms: f64,
    pub min_processing_ms: u64,
    pub max_processing_ms: u64,
    pub total_retries: u64,
    /// Tasks per minute of wall-clock run time.
    pub throughput_per_minute: f64,
}

/// Durable record of one run, written once at run close.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunArtifact {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_targets: usize,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub metrics: RunMetrics,
    pub results: Vec<ScrapeResult>,
}

impl RunArtifact {
    /// The run went through every target: not cancelled and not fatal.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.fatal_error.is_none()
    }
}

/// Which batch a progress line belongs to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub current_batch: usize,
    pub total_batches: usize,
}

/// One line of the NDJSON run stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunEvent {
    Progress {
        /// Integer percentage of `current / total`.
        progress: u8,
        current: usize,
        total: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(
            rename = "batchInfo",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        batch_info: Option<BatchInfo>,
    },
    Result {
        data: ScrapeResult,
    },
    Complete {
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn progress(current: usize, total: usize, location: Option<String>) -> Self {
        let progress = if total == 0 {
            0
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        RunEvent::Progress {
            progress,
            current,
            total,
            location,
            batch_info: None,
        }
    }

    /// Tag a progress line with its batch; other events are unchanged.
    pub fn with_batch(mut self, info: BatchInfo) -> Self {
        if let RunEvent::Progress { batch_info, .. } = &mut self {
            *batch_info = Some(info);
        }
        self
    }

    /// NDJSON line including the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"failed to encode event: {}"}}"#, e)
        });
        line.push('\n');
        line
    }
}

// HTTP request/response types

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ScrapeRunRequest {
    #[serde(default)]
    pub urls: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationHistoryRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
