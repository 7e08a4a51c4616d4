//! Ordered run events towards whoever started the run.
//!
//! The HTTP layer hands in an mpsc sender feeding the NDJSON body; scheduled
//! sweeps use [`NullSink`]. A send that fails means the caller went away;
//! [`EventSink::closed`] reports the same thing while nothing is being sent.

use crate::types::{BatchInfo, RunEvent, ScrapeResult};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("event sink closed")]
pub struct SinkClosed;

#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: RunEvent) -> Result<(), SinkClosed>;

    /// Resolves once the receiving side is gone. Sinks that cannot tell
    /// never resolve.
    async fn closed(&mut self) {
        futures::future::pending::<()>().await
    }
}

#[async_trait]
impl EventSink for mpsc::Sender<RunEvent> {
    async fn send(&mut self, event: RunEvent) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, event).await.map_err(|_| SinkClosed)
    }

    async fn closed(&mut self) {
        mpsc::Sender::closed(self).await
    }
}

/// Discards every event; used for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn send(&mut self, _event: RunEvent) -> Result<(), SinkClosed> {
        Ok(())
    }
}

/// Emits `progress(0, N)`, then per result `result` + `progress(k, N)`, then
/// `complete` or `error`.
pub struct ProgressStreamer {
    sink: Box<dyn EventSink>,
    total: usize,
    completed: usize,
    last_percent: u8,
    connected: bool,
}

impl ProgressStreamer {
    pub fn new(sink: impl EventSink + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            total: 0,
            completed: 0,
            last_percent: 0,
            connected: true,
        }
    }

    pub fn unattended() -> Self {
        Self::new(NullSink)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Resolves when the caller disconnects, without waiting for the next
    /// event. Pending forever for unattended runs.
    pub async fn closed(&mut self) {
        if self.connected {
            self.sink.closed().await;
            warn!("📴 run stream: caller disconnected after {} result(s)", self.completed);
            self.connected = false;
        }
    }

    async fn emit(&mut self, event: RunEvent) -> bool {
        if !self.connected {
            return false;
        }
        if self.sink.send(event).await.is_err() {
            warn!("📴 run stream: caller disconnected after {} result(s)", self.completed);
            self.connected = false;
        }
        self.connected
    }

    /// Announce a run over `total` targets.
    pub async fn start(&mut self, total: usize) -> bool {
        self.total = total;
        self.completed = 0;
        self.last_percent = 0;
        self.emit(RunEvent::progress(0, total, None)).await
    }

    /// Deliver one finished task. `false` means the result did not reach the caller.
    pub async fn result(&mut self, result: &ScrapeResult, batch: Option<BatchInfo>) -> bool {
        if !self
            .emit(RunEvent::Result {
                data: result.clone(),
            })
            .await
        {
            return false;
        }
        self.completed += 1;
        let mut event = RunEvent::progress(self.completed, self.total, result.location_name.clone());
        if let Some(info) = batch {
            event = event.with_batch(info);
        }
        if let RunEvent::Progress { progress, .. } = &event {
            debug_assert!(*progress >= self.last_percent, "progress went backwards");
            self.last_percent = *progress;
        }
        debug!("progress {}/{}", self.completed, self.total);
        // The result itself was delivered even if the progress line is not.
        self.emit(event).await;
        true
    }

    pub async fn complete(&mut self) -> bool {
        self.emit(RunEvent::Complete {
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn error(&mut self, message: impl Into<String>) -> bool {
        self.emit(RunEvent::Error {
            error: message.into(),
            timestamp: Utc::now(),
        })
        .await
    }
}
