//! Scripted automation backend for orchestrator tests.
#![allow(dead_code)]

use async_trait::async_trait;
use occupancy_scout::core::config::RunSettings;
use occupancy_scout::pipeline::retry::RetryPolicy;
use occupancy_scout::scraping::block_policy::BlockPolicy;
use occupancy_scout::scraping::{Automation, PageHandle, Session};
use occupancy_scout::{RawExtraction, ScrapeError, Target};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Settings with zero back-off and no pauses.
pub fn fast_settings(batch_size: usize, max_concurrent: usize, max_retries: u32) -> RunSettings {
    RunSettings {
        batch_size,
        max_concurrent,
        batch_group_size: 3,
        inter_batch_pause: Duration::ZERO,
        retry: RetryPolicy::immediate(max_retries),
        nav_timeout: Duration::from_secs(5),
        nav_timeout_step: Duration::from_secs(1),
        cancel_grace: Duration::from_secs(2),
        block_policy: BlockPolicy::new(&[], true),
    }
}

pub fn targets(n: usize) -> Vec<Target> {
    (1..=n)
        .map(|i| {
            Target::new(
                format!("Place {}", i),
                format!("https://www.google.com/maps/place/Place+{}/", i),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub enum Script {
    #[default]
    Succeed,
    /// Navigation fails this many times, then succeeds.
    FailTimes(u32),
    FailAlways,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub open_now: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub sessions_started: AtomicUsize,
    pub sessions_shut_down: AtomicUsize,
    /// Navigation attempts per URL.
    pub attempts: Mutex<HashMap<String, u32>>,
}

impl Counters {
    pub fn attempts_for(&self, url: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn peak(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Behaviour {
    scripts: HashMap<String, Script>,
    nav_delay: Duration,
    fail_session: bool,
    /// `new_page` fails for this many calls before succeeding.
    failing_pages: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedAutomation {
    behaviour: Arc<Behaviour>,
    pub counters: Arc<Counters>,
}

pub struct ScriptedBuilder {
    behaviour: Behaviour,
}

impl ScriptedAutomation {
    pub fn builder() -> ScriptedBuilder {
        ScriptedBuilder {
            behaviour: Behaviour::default(),
        }
    }
}

impl ScriptedBuilder {
    pub fn script(mut self, url: impl Into<String>, script: Script) -> Self {
        self.behaviour.scripts.insert(url.into(), script);
        self
    }

    pub fn nav_delay(mut self, delay: Duration) -> Self {
        self.behaviour.nav_delay = delay;
        self
    }

    pub fn fail_session(mut self) -> Self {
        self.behaviour.fail_session = true;
        self
    }

    pub fn failing_pages(self, n: usize) -> Self {
        self.behaviour.failing_pages.store(n, Ordering::SeqCst);
        self
    }

    pub fn build(self) -> ScriptedAutomation {
        ScriptedAutomation {
            behaviour: Arc::new(self.behaviour),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl Automation for ScriptedAutomation {
    async fn start_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
        if self.behaviour.fail_session {
            return Err(ScrapeError::Session("browser binary missing".into()));
        }
        self.counters.sessions_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct ScriptedSession {
    behaviour: Arc<Behaviour>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn new_page(&self, _policy: &BlockPolicy) -> Result<Box<dyn PageHandle>, ScrapeError> {
        let refused = self
            .behaviour
            .failing_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ScrapeError::Session("target crashed".into()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage {
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
            url: None,
            closed: false,
        }))
    }

    async fn shutdown(&self) -> Result<(), ScrapeError> {
        self.counters.sessions_shut_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedPage {
    behaviour: Arc<Behaviour>,
    counters: Arc<Counters>,
    url: Option<String>,
    closed: bool,
}

#[async_trait]
impl PageHandle for ScriptedPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ScrapeError> {
        let attempt = {
            let mut attempts = self.counters.attempts.lock().unwrap();
            let n = attempts.entry(url.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if !self.behaviour.nav_delay.is_zero() {
            tokio::time::sleep(self.behaviour.nav_delay).await;
        }
        let script = self.behaviour.scripts.get(url).copied().unwrap_or_default();
        let fails = match script {
            Script::Succeed => false,
            Script::FailTimes(n) => attempt <= n,
            Script::FailAlways => true,
        };
        if fails {
            return Err(ScrapeError::NavigationTimeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.url = Some(url.to_string());
        Ok(())
    }

    async fn extract(&mut self) -> Result<RawExtraction, ScrapeError> {
        let url = self.url.clone().ok_or(ScrapeError::NoData)?;
        let slug = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .replace('+', " ");
        Ok(RawExtraction {
            name: Some(format!("{} (live)", slug)),
            address: Some("Hauptstraße 1, Berlin".into()),
            rating: Some(4.5),
            occupancy_text: Some("Derzeit zu 40 % ausgelastet; normal sind 55 %.".into()),
            is_live: true,
        })
    }

    async fn close(&mut self) {
        if self.closed {
            panic!("page closed twice");
        }
        self.closed = true;
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}
