//! Run-scoped page pool on top of one shared automation session.
//!
//! Each scrape task leases its own page. A lease is released exactly once:
//! explicitly via `PageLease::release`, or as a fallback on drop (spawned onto
//! the runtime, since `Drop` cannot await).

use crate::core::error::ScrapeError;
use crate::scraping::automation::{PageHandle, Session};
use crate::scraping::block_policy::BlockPolicy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Open-handle accounting shared between the pool and its leases.
#[derive(Debug, Default)]
pub struct HandleGauge {
    open: AtomicUsize,
    peak: AtomicUsize,
    leased: AtomicUsize,
    released: AtomicUsize,
}

impl HandleGauge {
    fn opened(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.leased.fetch_add(1, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct ResourcePool {
    session: Box<dyn Session>,
    policy: BlockPolicy,
    gauge: Arc<HandleGauge>,
}

impl ResourcePool {
    pub fn new(session: Box<dyn Session>, policy: BlockPolicy) -> Self {
        Self {
            session,
            policy,
            gauge: Arc::new(HandleGauge::default()),
        }
    }

    pub fn gauge(&self) -> Arc<HandleGauge> {
        self.gauge.clone()
    }

    /// Open a fresh page with the block policy applied.
    pub async fn lease(&self) -> Result<PageLease, ScrapeError> {
        let page = self.session.new_page(&self.policy).await?;
        self.gauge.opened();
        debug!("page leased ({} open)", self.gauge.open());
        Ok(PageLease {
            page: Some(page),
            gauge: self.gauge.clone(),
        })
    }

    /// Tear down the session. Errors are logged, never raised.
    pub async fn shutdown(&self) {
        let open = self.gauge.open();
        if open > 0 {
            warn!("🧹 resource pool: shutting down with {} page(s) still open", open);
        }
        match self.session.shutdown().await {
            Ok(()) => debug!("🛑 resource pool: session closed"),
            Err(e) => warn!("resource pool: session shutdown error (non-fatal): {}", e),
        }
    }
}

/// A leased page. Dropping without `release` still closes it, off-task.
pub struct PageLease {
    page: Option<Box<dyn PageHandle>>,
    gauge: Arc<HandleGauge>,
}

impl PageLease {
    /// `None` only after `release`.
    pub fn page_mut(&mut self) -> Option<&mut (dyn PageHandle + 'static)> {
        self.page.as_deref_mut()
    }

    /// Close the page. Safe to call more than once; only the first call closes.
    pub async fn release(&mut self) {
        if let Some(mut page) = self.page.take() {
            page.close().await;
            self.gauge.closed();
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(mut page) = self.page.take() else {
            return;
        };
        let gauge = self.gauge.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    page.close().await;
                    gauge.closed();
                });
            }
            Err(_) => {
                // No runtime left to close on; count it so accounting stays balanced.
                warn!("page lease dropped outside a runtime; handle abandoned");
                gauge.closed();
            }
        }
    }
}
