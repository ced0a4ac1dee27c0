//! Chrome-backed portal sessions.
//!
//! Every `launch()` starts a dedicated Chrome process through the Chrome
//! DevTools Protocol; the process lives exactly as long as the returned
//! session. Form steps are driven with small DOM scripts, lookup windows are
//! found by watching the browser's target list for a new page.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::target::TargetId;
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::portal::{Criterion, PortalConfig, PortalLauncher, PortalSession};
use crate::{DateRange, HarvestError, Result, SearchQuery};

/// Interval between DOM polls.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const USER_AGENTS: &[&str] = &[
    DEFAULT_USER_AGENT,
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36 Edg/130.0.0.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
];

const WINDOW_SIZES: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
    (1600, 900),
    (1920, 1200),
    (2560, 1440),
];

/// Browser launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromeConfig {
    /// Whether to run the browser in headless mode.
    pub headless: bool,
    /// Path to the Chrome/Chromium executable. If `None`, auto-detected.
    pub chrome_path: Option<String>,
    /// Proxy URL for the browser to use.
    pub proxy_url: Option<String>,
    /// Additional launch arguments for Chrome.
    pub launch_args: Vec<String>,
    /// Pick a random window size and user agent per session.
    pub randomize_profile: bool,
    /// Window size used when the profile is not randomized.
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            proxy_url: None,
            launch_args: Vec::new(),
            randomize_profile: false,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

/// Cosmetic per-session browser identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProfile {
    pub user_agent: String,
    pub window: (u32, u32),
}

impl LaunchProfile {
    /// The configured window size with the default user agent.
    pub fn fixed(config: &ChromeConfig) -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window: (config.window_width, config.window_height),
        }
    }

    /// A random common window size and desktop user agent.
    pub fn randomized<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            user_agent: USER_AGENTS
                .choose(rng)
                .copied()
                .unwrap_or(DEFAULT_USER_AGENT)
                .to_string(),
            window: WINDOW_SIZES.choose(rng).copied().unwrap_or((1920, 1080)),
        }
    }
}

/// Launches one Chrome process per portal session.
pub struct ChromeLauncher {
    chrome: ChromeConfig,
    portal: PortalConfig,
}

impl ChromeLauncher {
    /// Creates a launcher.
    pub fn new(chrome: ChromeConfig, portal: PortalConfig) -> Self {
        Self { chrome, portal }
    }

    fn profile(&self) -> LaunchProfile {
        if self.chrome.randomize_profile {
            LaunchProfile::randomized(&mut rand::thread_rng())
        } else {
            LaunchProfile::fixed(&self.chrome)
        }
    }

    fn browser_config(&self, profile: &LaunchProfile) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder();

        if self.chrome.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        let executable = crate::browser_setup::resolve_chrome(self.chrome.chrome_path.as_deref())?;
        debug!("Using Chrome at: {}", executable.display());
        builder = builder
            .chrome_executable(executable)
            .window_size(profile.window.0, profile.window.1)
            .arg(format!("--user-agent={}", profile.user_agent))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--ignore-certificate-errors")
            .arg("--no-first-run");

        if let Some(ref proxy) = self.chrome.proxy_url {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }

        for arg in &self.chrome.launch_args {
            builder = builder.arg(arg);
        }

        builder
            .build()
            .map_err(|e| HarvestError::Browser(format!("Failed to build browser config: {}", e)))
    }
}

#[async_trait]
impl PortalLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn PortalSession>> {
        let profile = self.profile();
        let config = self.browser_config(&profile)?;
        debug!(
            "Launching browser ({}x{})",
            profile.window.0, profile.window.1
        );

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarvestError::browser("Failed to launch browser", e))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser CDP handler error: {}", e);
                }
            }
            debug!("Browser CDP handler exited");
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                if let Err(close_err) = browser.close().await {
                    warn!("Failed to close browser after launch error: {}", close_err);
                }
                handler_task.abort();
                return Err(HarvestError::browser("Failed to open tab", e));
            }
        };

        Ok(Box::new(ChromeSession {
            browser,
            handler_task,
            page,
            portal: self.portal.clone(),
            closed: false,
        }))
    }
}

/// A live browser driving the portal's search form.
pub struct ChromeSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
    portal: PortalConfig,
    closed: bool,
}

impl ChromeSession {
    fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.portal.step_timeout_secs)
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(self.portal.settle_ms)).await;
    }

    async fn open_lookup(&self, criterion: Criterion) -> Result<Page> {
        let window = criterion.lookup_window().ok_or_else(|| {
            HarvestError::Browser(format!("{:?} has no lookup window", criterion))
        })?;
        let before: Vec<TargetId> = self
            .browser
            .pages()
            .await
            .map_err(|e| HarvestError::browser("Failed to list pages", e))?
            .iter()
            .map(|page| page.target_id().clone())
            .collect();

        let label = format!("Use {} Lookup", window);
        let script = format!(
            "(() => {{ const link = Array.from(document.querySelectorAll('a'))\
               .find(a => a.textContent.includes({})); \
               if (!link) return false; link.click(); return true; }})()",
            js_string(&label)
        );
        wait_until_true(&self.page, &script, &label, self.step_timeout()).await?;

        let deadline = Instant::now() + Duration::from_secs(self.portal.popup_timeout_secs);
        loop {
            let pages = self
                .browser
                .pages()
                .await
                .map_err(|e| HarvestError::browser("Failed to list pages", e))?;
            if let Some(popup) = pages
                .into_iter()
                .find(|page| !before.contains(page.target_id()))
            {
                debug!("{} lookup window opened", window);
                return Ok(popup);
            }
            if Instant::now() >= deadline {
                return Err(HarvestError::PopupTimeout(window.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn select_report_style(&self) -> Result<()> {
        let popup = self.open_lookup(Criterion::ReportStyle).await?;
        let checkbox = format!(
            "input[type='checkbox'][value*={}]",
            js_string(&self.portal.report_style_value)
        );
        let step = self.step_timeout();

        let result: Result<()> = async {
            wait_for_element(&popup, &checkbox, step).await?;
            click_by_script(&popup, &checkbox).await
        }
        .await;

        close_popup(popup).await;
        result
    }

    async fn select_contributor(&self, contributor: &str) -> Result<()> {
        let popup = self.open_lookup(Criterion::Contributor).await?;
        let search_box = "form input[name='lookupsearch']";
        let first_row = "table[style*='width:100%'] tr:nth-of-type(2) input[type='checkbox']";
        let step = self.step_timeout();
        let settle = Duration::from_millis(self.portal.settle_ms);

        let result: Result<()> = async {
            let input = wait_for_element(&popup, search_box, step).await?;
            input
                .click()
                .await
                .map_err(|e| HarvestError::browser("Failed to focus lookup search", e))?;
            input
                .type_str(contributor)
                .await
                .map_err(|e| HarvestError::browser("Failed to type contributor", e))?;

            let submit = format!(
                "(() => {{ const input = document.querySelector({}); \
                   if (!input || !input.form) return false; input.form.submit(); return true; }})()",
                js_string(search_box)
            );
            if !run_script::<bool>(&popup, &submit).await? {
                return Err(HarvestError::Browser("Contributor lookup form not found".to_string()));
            }
            tokio::time::sleep(settle).await;

            wait_for_element(&popup, first_row, step).await?;
            click_by_script(&popup, first_row).await
        }
        .await;

        close_popup(popup).await;
        result
    }

    async fn fill_author(&self, query: &SearchQuery) -> Result<()> {
        let row = self.portal.result_row;
        if self.portal.fill_first_name {
            self.set_field(&format!("firstname{}", row), &query.first_name)
                .await?;
        }
        self.set_field(&format!("lastname{}", row), &query.last_name)
            .await?;
        run_script::<bool>(
            &self.page,
            &format!("(() => {{ setAuthorName({}); return true; }})()", row),
        )
        .await?;
        self.settle().await;
        Ok(())
    }

    async fn set_field(&self, name: &str, value: &str) -> Result<()> {
        let css = format!("input[name='{}']", name);
        wait_for_element(&self.page, &css, self.step_timeout()).await?;
        let script = format!(
            "(() => {{ const field = document.querySelector({}); if (!field) return false; \
               field.value = {}; field.dispatchEvent(new Event('change', {{ bubbles: true }})); \
               return true; }})()",
            js_string(&css),
            js_string(value)
        );
        if run_script::<bool>(&self.page, &script).await? {
            Ok(())
        } else {
            Err(HarvestError::Browser(format!("Field '{}' not found", name)))
        }
    }

    async fn settle_after_navigation(&self) {
        if let Err(e) = self.page.wait_for_navigation().await {
            debug!("Navigation wait failed: {}", e);
        }
        self.settle().await;
    }
}

#[async_trait]
impl PortalSession for ChromeSession {
    async fn open_search_page(&mut self) -> Result<()> {
        self.page
            .goto(self.portal.search_url.as_str())
            .await
            .map_err(|e| HarvestError::browser("Failed to open search page", e))?;
        self.settle_after_navigation().await;
        Ok(())
    }

    async fn set_date_range(&mut self, range: &DateRange) -> Result<()> {
        wait_for_element(&self.page, "#customDateChkb", self.step_timeout()).await?;
        let script = format!(
            "(() => {{ const custom = document.getElementById('customDateChkb'); \
               const from = document.getElementById('textInRangeFrom'); \
               const to = document.getElementById('textInRangeTo'); \
               if (!custom || !from || !to) return false; \
               custom.click(); from.value = {}; to.value = {}; return true; }})()",
            js_string(&range.portal_from()),
            js_string(&range.portal_to())
        );
        if !run_script::<bool>(&self.page, &script).await? {
            return Err(HarvestError::Browser("Date range fields not found".to_string()));
        }
        self.settle().await;
        Ok(())
    }

    async fn add_criterion(&mut self, criterion: Criterion, query: &SearchQuery) -> Result<()> {
        debug!("Adding criterion {:?} (code {})", criterion, criterion.code());
        run_script::<bool>(
            &self.page,
            &format!(
                "(() => {{ addCriteria({}, {}); return true; }})()",
                self.portal.criteria_group,
                criterion.code()
            ),
        )
        .await?;
        self.settle().await;

        match criterion {
            Criterion::ReportStyle => self.select_report_style().await,
            Criterion::Contributor => self.select_contributor(&query.contributor).await,
            Criterion::Author => self.fill_author(query).await,
            Criterion::Structure => Ok(()),
        }
    }

    async fn submit(&mut self) -> Result<()> {
        let css = format!("#submitbtn{}", self.portal.result_row);
        let button = wait_for_element(&self.page, &css, self.step_timeout()).await?;
        button
            .click()
            .await
            .map_err(|e| HarvestError::browser("Failed to submit search", e))?;
        Ok(())
    }

    async fn page_html(&mut self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| HarvestError::browser("Failed to get page content", e))
    }

    fn result_row(&self) -> u8 {
        self.portal.result_row
    }

    async fn open_results_view(&mut self) -> Result<()> {
        let css = format!("a.view[onclick='selectView({})']", self.portal.result_row);
        let link = wait_for_element(&self.page, &css, self.step_timeout()).await?;
        link.click()
            .await
            .map_err(|e| HarvestError::browser("Failed to open results view", e))?;
        self.settle_after_navigation().await;
        Ok(())
    }

    async fn follow_next_page(&mut self) -> Result<bool> {
        let script = "(() => { const next = Array.from(document.querySelectorAll('a'))\
                        .find(a => a.textContent.includes('Next')); \
                        if (!next) return false; next.click(); return true; })()";
        let clicked = run_script::<bool>(&self.page, script).await?;
        if clicked {
            self.settle_after_navigation().await;
        }
        Ok(clicked)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self
            .browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| HarvestError::browser("Failed to close browser", e));
        if let Err(e) = self.browser.wait().await {
            debug!("Browser process wait failed: {}", e);
        }
        self.handler_task.abort();
        debug!("Browser session closed");
        result
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        // chromiumoxide kills the child process when `Browser` drops.
        if !self.closed {
            self.handler_task.abort();
        }
    }
}

/// JSON-encodes `value` as a JavaScript string literal.
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn click_script(css: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
        js_string(css)
    )
}

async fn click_by_script(page: &Page, css: &str) -> Result<()> {
    if run_script::<bool>(page, &click_script(css)).await? {
        Ok(())
    } else {
        Err(HarvestError::Browser(format!("Element '{}' not found", css)))
    }
}

async fn run_script<T: DeserializeOwned>(page: &Page, script: &str) -> Result<T> {
    page.evaluate_expression(script)
        .await
        .map_err(|e| HarvestError::browser("Script evaluation failed", e))?
        .into_value::<T>()
        .map_err(|e| HarvestError::browser("Unexpected script result", e))
}

async fn wait_for_element(page: &Page, css: &str, timeout: Duration) -> Result<Element> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(element) = page.find_element(css).await {
            return Ok(element);
        }
        if Instant::now() >= deadline {
            return Err(HarvestError::Browser(format!(
                "Element '{}' not found within {}s",
                css,
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_until_true(page: &Page, script: &str, what: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match run_script::<bool>(page, script).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => debug!("Waiting for '{}': {}", what, e),
        }
        if Instant::now() >= deadline {
            return Err(HarvestError::Browser(format!(
                "'{}' not found within {}s",
                what,
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn close_popup(popup: Page) {
    if let Err(e) = popup.close().await {
        warn!("Failed to close lookup window: {}", e);
    }
}
