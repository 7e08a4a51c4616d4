use thiserror::Error;

/// Task-level failures raised by the automation boundary and the retry loop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScrapeError {
    #[error("navigation to {url} timed out after {timeout_ms}ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no name or occupancy data found")]
    NoData,

    #[error("automation session unavailable: {0}")]
    Session(String),

    #[error("cancelled")]
    Cancelled,
}

impl ScrapeError {
    /// Timeouts, transport hiccups and empty pages are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::NavigationTimeout { .. } | ScrapeError::Transport(_) | ScrapeError::NoData
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_taxonomy() {
        assert!(ScrapeError::NavigationTimeout {
            url: "https://x".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(ScrapeError::Transport("reset".into()).is_retryable());
        assert!(ScrapeError::NoData.is_retryable());
        assert!(!ScrapeError::Session("gone".into()).is_retryable());
        assert!(!ScrapeError::Cancelled.is_retryable());
    }
}
