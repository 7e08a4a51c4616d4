use crate::types::{RunMetrics, ScrapeResult};
use std::time::Duration;

impl RunMetrics {
    /// Aggregate per-task results at run close.
    pub fn compute(results: &[ScrapeResult], run_time: Duration) -> Self {
        let total_tasks = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let failed = total_tasks - successful;
        let run_time_ms = run_time.as_millis() as u64;

        let success_rate = if total_tasks == 0 {
            0.0
        } else {
            successful as f64 * 100.0 / total_tasks as f64
        };

        let mut times: Vec<u64> = results.iter().map(|r| r.processing_time_ms).collect();
        times.sort_unstable();

        let avg_processing_ms = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<u64>() as f64 / times.len() as f64
        };

        let median_processing_ms = match times.len() {
            0 => 0.0,
            n if n % 2 == 1 => times[n / 2] as f64,
            n => (times[n / 2 - 1] + times[n / 2]) as f64 / 2.0,
        };

        let minutes = run_time.as_secs_f64() / 60.0;
        let throughput_per_minute = if minutes > 0.0 {
            total_tasks as f64 / minutes
        } else {
            0.0
        };

        Self {
            total_tasks,
            successful,
            failed,
            success_rate,
            run_time_ms,
            avg_processing_ms,
            median_processing_ms,
            min_processing_ms: times.first().copied().unwrap_or(0),
            max_processing_ms: times.last().copied().unwrap_or(0),
            total_retries: results.iter().map(|r| r.retries_used as u64).sum(),
            throughput_per_minute,
        }
    }

    /// One-line summary for the run log.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} successful ({:.1}%), {} retries, {:.0}ms median, {:.1} tasks/min",
            self.successful,
            self.total_tasks,
            self.success_rate,
            self.total_retries,
            self.median_processing_ms,
            self.throughput_per_minute
        )
    }
}
