//! Browser-automation boundary.
//!
//! The orchestrator only talks to these traits. `browser_manager` provides the
//! chromiumoxide implementation; tests plug in scripted backends.

use crate::core::error::ScrapeError;
use crate::scraping::block_policy::BlockPolicy;
use crate::types::RawExtraction;
use async_trait::async_trait;
use std::time::Duration;

/// Factory for run-scoped sessions.
#[async_trait]
pub trait Automation: Send + Sync {
    /// Start the one shared session for a run.
    async fn start_session(&self) -> Result<Box<dyn Session>, ScrapeError>;

    /// Whether a backend is installed at all (used by `/health`).
    fn is_available(&self) -> bool {
        true
    }
}

/// One shared automation session, lent out as per-task pages.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open a blank page with `policy` already applied.
    async fn new_page(&self, policy: &BlockPolicy) -> Result<Box<dyn PageHandle>, ScrapeError>;

    /// Tear the session down. Failures are reported for logging only.
    async fn shutdown(&self) -> Result<(), ScrapeError>;
}

/// Per-task page handle.
#[async_trait]
pub trait PageHandle: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ScrapeError>;

    async fn extract(&mut self) -> Result<RawExtraction, ScrapeError>;

    /// Must never fail; implementations swallow and log close errors.
    /// Called exactly once by the owning `PageLease`.
    async fn close(&mut self);
}
