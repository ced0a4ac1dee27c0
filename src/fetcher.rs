//! Document retrieval over HTTP.
//!
//! Each download is retried with capped exponential backoff. Responses are
//! streamed into a `.part` file that is only renamed to its final name once
//! the content type and byte count check out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, REFERER};
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::ratelimit::RateGate;
use crate::{DownloadTask, HarvestError, Result};

/// Configuration for document downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per document, redirects included.
    pub max_attempts: u32,
    /// Backoff base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Longest wait for any single read, in seconds.
    pub read_timeout_secs: u64,
    /// Optional bound on a whole request, body included.
    pub total_timeout_secs: Option<u64>,
    /// Content types accepted as documents (prefix match, case-insensitive).
    pub document_types: Vec<String>,
    /// File extension for saved documents.
    pub extension: String,
    /// Referer header sent with every request.
    pub referer: Option<String>,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Proxy for document requests (http, https or socks5).
    pub proxy_url: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            total_timeout_secs: None,
            document_types: vec!["application/pdf".to_string()],
            extension: "pdf".to_string(),
            referer: Some("https://www.mergentonline.com".to_string()),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
                .to_string(),
            proxy_url: None,
        }
    }
}

/// Outcome of one successful HTTP exchange.
#[derive(Debug, PartialEq, Eq)]
enum FetchStep {
    /// Body written; number of bytes.
    Saved(u64),
    /// HTML meta-refresh pointing elsewhere.
    Redirect(String),
}

/// Downloads documents to disk.
pub struct DocumentFetcher {
    client: Client,
    config: FetchConfig,
    gate: Option<Arc<RateGate>>,
}

impl DocumentFetcher {
    /// Creates a fetcher with its own HTTP client.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "application/pdf,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        if let Some(referer) = &config.referer {
            let value = HeaderValue::from_str(referer)
                .map_err(|e| HarvestError::Config(format!("invalid referer: {}", e)))?;
            headers.insert(REFERER, value);
        }

        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .redirect(Policy::limited(10))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs));

        if let Some(total) = config.total_timeout_secs {
            builder = builder.timeout(Duration::from_secs(total));
        }
        if let Some(proxy_url) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }

        let client = builder.build()?;

        Ok(Self::with_client(client, config))
    }

    /// Creates a fetcher around an existing client.
    pub fn with_client(client: Client, config: FetchConfig) -> Self {
        Self {
            client,
            config,
            gate: None,
        }
    }

    /// Acquires `gate` before every attempt.
    pub fn with_rate_gate(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Returns the fetcher configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Downloads `task` into `directory`, returning the saved file's path.
    ///
    /// Fails with [`HarvestError::FetchFailure`] once every attempt is spent.
    pub async fn fetch(&self, task: &DownloadTask, directory: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(directory).await?;
        let target = directory.join(task.file_name(&self.config.extension));
        let partial = target.with_extension(format!("{}.part", self.config.extension));

        let max_attempts = self.config.max_attempts.max(1);
        let mut url = task.url.clone();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            if let Some(gate) = &self.gate {
                gate.acquire().await;
            }

            info!("Downloading {} (attempt {}/{})", url, attempt, max_attempts);
            match self.attempt(&url, &partial).await {
                Ok(FetchStep::Saved(bytes)) => {
                    tokio::fs::rename(&partial, &target).await?;
                    info!("Saved {} ({} bytes)", target.display(), bytes);
                    return Ok(target);
                }
                Ok(FetchStep::Redirect(next)) => {
                    info!("Following meta refresh to {}", next);
                    last_error =
                        format!("meta refresh to {} not followed: attempts exhausted", next);
                    url = next;
                }
                Err(e) => {
                    discard(&partial).await;
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = backoff_delay(
                            attempt,
                            Duration::from_millis(self.config.base_delay_ms),
                            Duration::from_millis(self.config.max_delay_ms),
                        );
                        warn!(
                            "Download failed: {}. Retrying in {:.1}s",
                            last_error,
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(HarvestError::FetchFailure {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    async fn attempt(&self, url: &str, partial: &Path) -> Result<FetchStep> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.contains("text/html") {
            let base = response.url().clone();
            let body = response.text().await?;
            return match meta_refresh_target(&body, &base)? {
                Some(next) => Ok(FetchStep::Redirect(next)),
                None => Err(HarvestError::ContentMismatch(
                    "expected a document, got an HTML page".to_string(),
                )),
            };
        }

        if !self.is_document_type(&content_type) {
            return Err(HarvestError::ContentMismatch(format!(
                "unexpected content type '{}'",
                content_type
            )));
        }

        let declared = response.content_length();
        let written = stream_to_file(response, partial).await?;
        verify_length(declared, written)?;
        Ok(FetchStep::Saved(written))
    }

    fn is_document_type(&self, content_type: &str) -> bool {
        self.config
            .document_types
            .iter()
            .any(|accepted| content_type.starts_with(&accepted.to_ascii_lowercase()))
    }
}

async fn stream_to_file(mut response: Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    debug!("Wrote {} bytes to {}", written, path.display());
    Ok(written)
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

/// Fails when a non-zero declared length disagrees with the bytes written.
fn verify_length(declared: Option<u64>, written: u64) -> Result<()> {
    match declared {
        Some(expected) if expected != 0 && expected != written => Err(
            HarvestError::ContentMismatch(format!(
                "declared {} bytes, received {}",
                expected, written
            )),
        ),
        _ => Ok(()),
    }
}

/// `min(base * 2^attempt + jitter, cap)`, jitter uniform in `[0, base)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.min(20)));
    let base_ms = base.as_millis() as u64;
    let jitter = if base_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
    };
    exponential.saturating_add(jitter).min(cap)
}

/// Extracts the target of an HTML `<meta http-equiv="refresh">`, resolved against `base`.
pub fn meta_refresh_target(html: &str, base: &Url) -> Result<Option<String>> {
    let document = Html::parse_document(html);
    let meta_selector = Selector::parse("meta[http-equiv][content]")
        .map_err(|e| HarvestError::Parse(format!("Failed to parse selector: {:?}", e)))?;

    for meta in document.select(&meta_selector) {
        let is_refresh = meta
            .value()
            .attr("http-equiv")
            .is_some_and(|v| v.eq_ignore_ascii_case("refresh"));
        if !is_refresh {
            continue;
        }
        let content = meta.value().attr("content").unwrap_or_default();
        let Some(pos) = content.to_ascii_lowercase().find("url=") else {
            continue;
        };
        let target = content[pos + 4..].trim().trim_matches(|c| c == '\'' || c == '"');
        if target.is_empty() {
            continue;
        }
        return Ok(Some(base.join(target)?.to_string()));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileLabel;

    fn quick_config() -> FetchConfig {
        FetchConfig {
            max_attempts: 5,
            base_delay_ms: 0,
            max_delay_ms: 0,
            referer: None,
            ..Default::default()
        }
    }

    fn task(url: String) -> DownloadTask {
        DownloadTask {
            url,
            label: FileLabel::new("Acme Research", "42", "Smith, J"),
            file_num: 3,
            year: "2010".to_string(),
        }
    }

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_delay_ms, 60_000);
        assert_eq!(config.document_types, vec!["application/pdf".to_string()]);
        assert_eq!(config.extension, "pdf");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let first = backoff_delay(1, base, cap);
        assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(3));
        let third = backoff_delay(3, base, cap);
        assert!(third >= Duration::from_secs(8) && third < Duration::from_secs(9));
        assert_eq!(backoff_delay(10, base, cap), cap);
        assert_eq!(backoff_delay(u32::MAX, base, cap), cap);
    }

    #[test]
    fn test_backoff_zero_base() {
        assert_eq!(
            backoff_delay(4, Duration::ZERO, Duration::from_secs(60)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_verify_length() {
        assert!(verify_length(None, 10).is_ok());
        assert!(verify_length(Some(0), 10).is_ok());
        assert!(verify_length(Some(10), 10).is_ok());
        assert!(matches!(
            verify_length(Some(11), 10),
            Err(HarvestError::ContentMismatch(_))
        ));
    }

    #[test]
    fn test_meta_refresh_absolute() {
        let base = Url::parse("https://portal.example/doc").unwrap();
        let html = r#"<html><head><meta http-equiv="refresh" content="0; url=https://bucket.example/file.pdf?sig=abc"></head></html>"#;
        assert_eq!(
            meta_refresh_target(html, &base).unwrap().as_deref(),
            Some("https://bucket.example/file.pdf?sig=abc")
        );
    }

    #[test]
    fn test_meta_refresh_relative_and_quoted() {
        let base = Url::parse("https://portal.example/a/doc").unwrap();
        let html = r#"<meta HTTP-EQUIV="Refresh" content="2;URL='/files/x.pdf'">"#;
        assert_eq!(
            meta_refresh_target(html, &base).unwrap().as_deref(),
            Some("https://portal.example/files/x.pdf")
        );
    }

    #[test]
    fn test_meta_refresh_absent() {
        let base = Url::parse("https://portal.example/").unwrap();
        let html = r#"<meta http-equiv="content-type" content="text/html; charset=utf-8">"#;
        assert_eq!(meta_refresh_target(html, &base).unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_retries_until_document() {
        let mut server = mockito::Server::new_async().await;
        let body = b"%PDF-1.4 analyst report body";
        let not_ready = server
            .mock("GET", "/doc")
            .with_status(200)
            .with_header("content-type", "text/plain")
            .with_body("still rendering")
            .expect(2)
            .create_async()
            .await;
        let ready = server
            .mock("GET", "/doc")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body(body)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = DocumentFetcher::new(quick_config()).unwrap();
        let path = fetcher
            .fetch(&task(format!("{}/doc", server.url())), dir.path())
            .await
            .unwrap();

        not_ready.assert_async().await;
        ready.assert_async().await;
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "Acme Research_42_Smith_3_2010.pdf"
        );
        let saved = std::fs::read(&path).unwrap();
        assert_eq!(saved.len(), body.len());
        assert!(!path.with_extension("pdf.part").exists());
    }

    #[tokio::test]
    async fn test_fetch_follows_meta_refresh() {
        let mut server = mockito::Server::new_async().await;
        let refresh = format!(
            r#"<html><head><meta http-equiv="refresh" content="0;url={}/s3/report.pdf"></head></html>"#,
            server.url()
        );
        let landing = server
            .mock("GET", "/load")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(refresh)
            .expect(1)
            .create_async()
            .await;
        let document = server
            .mock("GET", "/s3/report.pdf")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body("%PDF-1.7")
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = DocumentFetcher::new(quick_config()).unwrap();
        let path = fetcher
            .fetch(&task(format!("{}/load", server.url())), dir.path())
            .await
            .unwrap();

        landing.assert_async().await;
        document.assert_async().await;
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn test_fetch_exhausts_attempts() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            max_attempts: 3,
            ..quick_config()
        };
        let fetcher = DocumentFetcher::new(config).unwrap();
        let result = fetcher
            .fetch(&task(format!("{}/missing", server.url())), dir.path())
            .await;

        failing.assert_async().await;
        match result {
            Err(HarvestError::FetchFailure { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected FetchFailure, got {:?}", other),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_html_without_refresh_is_failure() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("GET", "/login")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html><body>Please sign in</body></html>")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            max_attempts: 2,
            ..quick_config()
        };
        let fetcher = DocumentFetcher::new(config).unwrap();
        let err = fetcher
            .fetch(&task(format!("{}/login", server.url())), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("HTML page"));
    }

    #[tokio::test]
    async fn test_fetch_reports_unfollowed_refresh() {
        let mut server = mockito::Server::new_async().await;
        let refresh = format!(
            r#"<meta http-equiv="refresh" content="0;url={}/next">"#,
            server.url()
        );
        let _landing = server
            .mock("GET", "/load")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(refresh)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            max_attempts: 1,
            ..quick_config()
        };
        let fetcher = DocumentFetcher::new(config).unwrap();
        let err = fetcher
            .fetch(&task(format!("{}/load", server.url())), dir.path())
            .await
            .unwrap_err();
        match err {
            HarvestError::FetchFailure { attempts, reason } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("/next not followed"), "reason: {}", reason);
            }
            other => panic!("Expected FetchFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_steady_body_is_not_cut_off() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let body = b"%PDF-1";
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await.unwrap();
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/pdf\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            for byte in body {
                tokio::time::sleep(Duration::from_millis(400)).await;
                socket.write_all(&[*byte]).await.unwrap();
                socket.flush().await.unwrap();
            }
        });

        // The transfer takes about 2.4s while no single read waits past 1s.
        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            max_attempts: 1,
            read_timeout_secs: 1,
            ..quick_config()
        };
        let fetcher = DocumentFetcher::new(config).unwrap();
        let path = fetcher
            .fetch(&task(format!("http://{}/doc", address)), dir.path())
            .await
            .unwrap();

        assert_eq!(std::fs::read(path).unwrap(), body);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_with_rate_gate() {
        use crate::ratelimit::{PacingConfig, RateLimitConfig};

        let mut server = mockito::Server::new_async().await;
        let _doc = server
            .mock("GET", "/doc")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body("%PDF")
            .create_async()
            .await;

        let gate = Arc::new(RateGate::new(RateLimitConfig {
            pacing: PacingConfig::disabled(),
            ..Default::default()
        }));
        let dir = tempfile::tempdir().unwrap();
        let fetcher = DocumentFetcher::new(quick_config())
            .unwrap()
            .with_rate_gate(Arc::clone(&gate));
        fetcher
            .fetch(&task(format!("{}/doc", server.url())), dir.path())
            .await
            .unwrap();
        assert_eq!(gate.in_window().await, 1);
    }
}
