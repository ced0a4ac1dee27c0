//! Harvest configuration.
//!
//! Every section has defaults, so a configuration file only needs the
//! values it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::browser::ChromeConfig;
use crate::fetcher::FetchConfig;
use crate::portal::PortalConfig;
use crate::ratelimit::RateLimitConfig;
use crate::session::SessionConfig;
use crate::{DateRange, HarvestError, Result};

/// Top-level configuration for a harvest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Root directory for downloaded documents.
    pub output_dir: PathBuf,
    /// Analysts processed concurrently, each with its own browser.
    pub workers: usize,
    /// Publication date range applied to every search.
    pub dates: DateRange,
    pub portal: PortalConfig,
    pub browser: ChromeConfig,
    pub session: SessionConfig,
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            workers: 1,
            dates: DateRange::default(),
            portal: PortalConfig::default(),
            browser: ChromeConfig::default(),
            session: SessionConfig::default(),
            fetch: FetchConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Parses a JSON document over the defaults.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            HarvestError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Set the number of concurrent workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the request budget per window.
    pub fn with_rate_limit(mut self, max_requests: usize) -> Self {
        self.rate_limit.max_requests = max_requests;
        self
    }

    /// Show the browser window.
    pub fn with_headed(mut self, headed: bool) -> Self {
        self.browser.headless = !headed;
        self
    }

    /// Route both the browser and document downloads through `proxy_url`.
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        let proxy_url = proxy_url.into();
        self.browser.proxy_url = Some(proxy_url.clone());
        self.fetch.proxy_url = Some(proxy_url);
        self
    }

    /// Rejects values the harvest cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(HarvestError::Config(msg.to_string()));

        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.rate_limit.max_requests == 0 {
            return invalid("rate_limit.max_requests must be positive");
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs must be positive");
        }
        if self.rate_limit.wait_max_ms < self.rate_limit.wait_min_ms {
            return invalid("rate_limit.wait_max_ms is below wait_min_ms");
        }
        if self.session.max_attempts == 0 {
            return invalid("session.max_attempts must be at least 1");
        }
        if self.session.max_pages == 0 {
            return invalid("session.max_pages must be at least 1");
        }
        if self.fetch.max_attempts == 0 {
            return invalid("fetch.max_attempts must be at least 1");
        }
        if self.fetch.document_types.is_empty() {
            return invalid("fetch.document_types must not be empty");
        }
        for proxy in [&self.browser.proxy_url, &self.fetch.proxy_url].into_iter().flatten() {
            validate_proxy(proxy)?;
        }
        DateRange::new(self.dates.from, self.dates.to)?;
        Ok(())
    }
}

fn validate_proxy(proxy_url: &str) -> Result<()> {
    let url = url::Url::parse(proxy_url)?;
    match url.scheme() {
        "http" | "https" | "socks5" => {}
        scheme => {
            return Err(HarvestError::Config(format!(
                "Unsupported proxy protocol: {}",
                scheme
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(HarvestError::Config(format!("Missing proxy host in {}", proxy_url)));
    }
    Ok(())
}
