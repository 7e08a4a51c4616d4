//! Native browser automation using `chromiumoxide`.
//!
//! This module is the **single source of truth** for:
//! * Finding a usable browser executable (Brave → Chrome → Chromium, cross-platform).
//! * Launching the one headless browser a run shares (`ChromiumAutomation`).
//! * Per-task tabs with the block policy enforced through CDP request
//!   interception, consent dismissal and a wait for the place panel
//!   (`ChromiumPage`).
//!
//! No external headless-browser sidecar is required.

use crate::core::error::ScrapeError;
use crate::scraping::automation::{Automation, PageHandle, Session};
use crate::scraping::block_policy::BlockPolicy;
use crate::scraping::extract::extract_place;
use crate::types::RawExtraction;
use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Realistic User-Agent pool ────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Place page readiness ─────────────────────────────────────────────────────

/// Button captions of the cookie consent wall (English and German locales).
const CONSENT_BUTTON_TEXTS: &[&str] = &["Accept", "Alle akzeptieren", "Akzeptieren"];

/// Fallback consent controls when no caption matches.
const CONSENT_SELECTORS: &[&str] = &[
    r#"[aria-label*="Accept"]"#,
    r#"[aria-label*="akzeptieren"]"#,
    r#"[data-value="Alle akzeptieren"]"#,
];

/// Any of these means the place panel has rendered.
pub const PLACE_PANEL_SELECTORS: &[&str] = &[
    r#"[data-value="Bewertungen"]"#,
    r#"h1[data-attrid="title"]"#,
    "h1.DUwDvf",
];

const CONSENT_SETTLE: Duration = Duration::from_millis(1500);
const PANEL_WAIT: Duration = Duration::from_secs(8);
const PANEL_POLL: Duration = Duration::from_millis(250);

fn js_list(items: &[&str]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Script that clicks the first consent control it finds; evaluates to `true`
/// when it clicked something.
pub fn consent_script() -> String {
    format!(
        r#"(() => {{
  const texts = {texts};
  const buttons = Array.from(document.querySelectorAll('button'));
  let target = buttons.find(b => texts.includes((b.innerText || '').trim()));
  if (!target) target = document.querySelector({selectors}.join(', '));
  if (!target) return false;
  target.click();
  return true;
}})()"#,
        texts = js_list(CONSENT_BUTTON_TEXTS),
        selectors = js_list(CONSENT_SELECTORS),
    )
}

/// Script that evaluates to `true` once the place panel is in the DOM.
pub fn place_panel_script() -> String {
    format!(
        "document.querySelector({}.join(', ')) !== null",
        js_list(PLACE_PANEL_SELECTORS)
    )
}

async fn evaluate_bool(page: &Page, script: String) -> bool {
    page.evaluate(script)
        .await
        .ok()
        .and_then(|v| v.into_value::<serde_json::Value>().ok())
        .and_then(|j| j.as_bool())
        .unwrap_or(false)
}

/// Click through the consent wall if one is showing.
async fn dismiss_consent(page: &Page) {
    if evaluate_bool(page, consent_script()).await {
        debug!("🍪 consent dialog dismissed");
        tokio::time::sleep(CONSENT_SETTLE).await;
    }
}

/// Poll until the place panel renders or `timeout` passes. A panel that never
/// shows is left to the extractor, which reports missing data.
async fn wait_for_place_panel(page: &Page, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    let script = place_panel_script();
    loop {
        if evaluate_bool(page, script.clone()).await {
            debug!("place panel ready after {}ms", start.elapsed().as_millis());
            return true;
        }
        if start.elapsed() >= timeout {
            debug!("place panel not rendered within {}ms", timeout.as_millis());
            return false;
        }
        tokio::time::sleep(PANEL_POLL).await;
    }
}

// ── Request interception ─────────────────────────────────────────────────────

/// Pause every request of the tab and fail the ones `policy` blocks.
///
/// The listener is registered before `Fetch.enable` so no paused request is
/// missed; an unanswered pause would stall the page.
async fn intercept_requests(page: &Page, policy: BlockPolicy) -> Result<JoinHandle<()>, CdpError> {
    let mut paused = page.event_listener::<EventRequestPaused>().await?;
    page.execute(fetch::EnableParams::default()).await?;

    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let request_id = event.request_id.clone();
            let answered = if policy.blocks_request(&event.request.url, event.resource_type.as_ref()) {
                page.execute(FailRequestParams::new(request_id, ErrorReason::BlockedByClient))
                    .await
                    .map(|_| ())
            } else {
                page.execute(ContinueRequestParams::new(request_id))
                    .await
                    .map(|_| ())
            };
            if let Err(e) = answered {
                debug!("request interception: {}", e);
            }
        }
    }))
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan – finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "brave-browser",
            "brave",
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/brave-browser",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Headless browser config builder ──────────────────────────────────────────

/// Build a `BrowserConfig` for headless operation.
///
/// `--disable-blink-features=AutomationControlled` hides `navigator.webdriver`;
/// the locale is pinned to German so the place pages render the phrasing the
/// occupancy parser knows best.
pub fn build_headless_config(exe: &str, width: u32, height: u32) -> Result<BrowserConfig, ScrapeError> {
    let ua = random_user_agent();

    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .arg("--lang=de-DE")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua))
        .build()
        .map_err(|e| ScrapeError::Session(format!("failed to build browser config: {}", e)))
}

// ── Automation backend ───────────────────────────────────────────────────────

/// Launches one headless browser per run.
#[derive(Debug, Clone, Default)]
pub struct ChromiumAutomation {
    exe: Option<String>,
}

impl ChromiumAutomation {
    /// Uses the auto-discovered executable, if any.
    pub fn new_auto() -> Self {
        Self {
            exe: find_chrome_executable(),
        }
    }

    pub fn with_executable(exe: impl Into<String>) -> Self {
        Self {
            exe: Some(exe.into()),
        }
    }
}

#[async_trait]
impl Automation for ChromiumAutomation {
    async fn start_session(&self) -> Result<Box<dyn Session>, ScrapeError> {
        let exe = self.exe.as_deref().ok_or_else(|| {
            ScrapeError::Session(
                "no browser found; install Brave, Chrome or Chromium, or set CHROME_EXECUTABLE".into(),
            )
        })?;

        info!("🚀 launching headless browser ({})", exe);
        let config = build_headless_config(exe, 1920, 1080)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScrapeError::Session(format!("failed to launch ({}): {}", exe, e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }
        });

        Ok(Box::new(ChromiumSession {
            browser: Mutex::new(Some(browser)),
            handler_task,
        }))
    }

    fn is_available(&self) -> bool {
        self.exe.is_some()
    }
}

pub struct ChromiumSession {
    browser: Mutex<Option<Browser>>,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl Session for ChromiumSession {
    async fn new_page(&self, policy: &BlockPolicy) -> Result<Box<dyn PageHandle>, ScrapeError> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| ScrapeError::Session("browser already shut down".into()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScrapeError::Session(format!("failed to open tab: {}", e)))?;
        drop(guard);

        // Blocking is best-effort: a tab without it still scrapes, just slower.
        let interceptor = match intercept_requests(&page, policy.clone()).await {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("block policy not applied to tab: {}", e);
                None
            }
        };

        Ok(Box::new(ChromiumPage {
            page: Some(page),
            interceptor,
        }))
    }

    async fn shutdown(&self) -> Result<(), ScrapeError> {
        let browser = self.browser.lock().await.take();
        let result = match browser {
            Some(mut b) => {
                let closed = b
                    .close()
                    .await
                    .map(|_| ())
                    .map_err(|e| ScrapeError::Session(format!("browser close failed: {}", e)));
                let _ = b.wait().await;
                closed
            }
            None => Ok(()),
        };
        self.handler_task.abort();
        if result.is_ok() {
            info!("🛑 headless browser shut down");
        }
        result
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        // Drop cannot await; spawn the close so no Chromium process outlives the run.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Ok(mut guard) = self.browser.try_lock() {
            if let Some(mut browser) = guard.take() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                });
            }
        }
        self.handler_task.abort();
    }
}

pub struct ChromiumPage {
    page: Option<Page>,
    interceptor: Option<JoinHandle<()>>,
}

impl ChromiumPage {
    fn page(&self) -> Result<&Page, ScrapeError> {
        self.page
            .as_ref()
            .ok_or_else(|| ScrapeError::Session("page already closed".into()))
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ScrapeError> {
        let page = self.page()?;
        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => {
                dismiss_consent(page).await;
                wait_for_place_panel(page, PANEL_WAIT).await;
                Ok(())
            }
            Ok(Err(e)) => Err(ScrapeError::Transport(e.to_string())),
            Err(_) => Err(ScrapeError::NavigationTimeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn extract(&mut self) -> Result<RawExtraction, ScrapeError> {
        let page = self.page()?;
        let html = page
            .content()
            .await
            .map_err(|e| ScrapeError::Transport(format!("failed to read page content: {}", e)))?;
        let raw = extract_place(&html);
        if raw.has_signal() {
            Ok(raw)
        } else {
            Err(ScrapeError::NoData)
        }
    }

    async fn close(&mut self) {
        if let Some(task) = self.interceptor.take() {
            task.abort();
        }
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("tab close error (non-fatal): {}", e);
            }
        }
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        if let Some(task) = self.interceptor.take() {
            task.abort();
        }
    }
}
