//! End-to-end tests: roster -> search -> download.
//!
//! The default tests run against a scripted portal and a local mock document
//! server. Tests that need a Chrome installation or the live portal are
//! marked with `#[ignore]`.
//!
//! Run with: `cargo test -p report-harvest --test integration -- --ignored`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use report_harvest::{
    analyst_jobs, AnalystRecord, Criterion, DateRange, FetchConfig, HarvestConfig, Harvester,
    PacingConfig, PortalLauncher, PortalSession, Result, SearchQuery, SearchStatus,
};

/// Scripted portal: listing pages per contributor, N/A for anyone else.
struct ScriptedPortal {
    pages: HashMap<String, Vec<String>>,
    launches: AtomicU32,
    closes: Arc<AtomicU32>,
}

impl ScriptedPortal {
    fn new(pages: HashMap<String, Vec<String>>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            launches: AtomicU32::new(0),
            closes: Arc::new(AtomicU32::new(0)),
        })
    }
}

struct ScriptedSession {
    pages: HashMap<String, Vec<String>>,
    contributor: Option<String>,
    criteria: Vec<Criterion>,
    submitted: bool,
    in_results: bool,
    page: usize,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl PortalLauncher for ScriptedPortal {
    async fn launch(&self) -> Result<Box<dyn PortalSession>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            pages: self.pages.clone(),
            contributor: None,
            criteria: Vec::new(),
            submitted: false,
            in_results: false,
            page: 0,
            closes: Arc::clone(&self.closes),
        }))
    }
}

impl ScriptedSession {
    fn listing(&self) -> Option<&Vec<String>> {
        self.contributor.as_ref().and_then(|c| self.pages.get(c))
    }
}

#[async_trait]
impl PortalSession for ScriptedSession {
    async fn open_search_page(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_date_range(&mut self, range: &DateRange) -> Result<()> {
        assert!(range.from <= range.to);
        Ok(())
    }

    async fn add_criterion(&mut self, criterion: Criterion, query: &SearchQuery) -> Result<()> {
        if criterion == Criterion::Contributor {
            self.contributor = Some(query.contributor.clone());
        }
        self.criteria.push(criterion);
        Ok(())
    }

    async fn submit(&mut self) -> Result<()> {
        assert_eq!(self.criteria, Criterion::SEQUENCE.to_vec());
        self.submitted = true;
        Ok(())
    }

    async fn page_html(&mut self) -> Result<String> {
        if !self.submitted {
            return Ok("<html><body>search form</body></html>".to_string());
        }
        Ok(match (self.in_results, self.listing()) {
            (true, Some(pages)) => pages[self.page].clone(),
            (false, Some(_)) => marker("3 Matches"),
            (_, None) => marker("N/A"),
        })
    }

    fn result_row(&self) -> u8 {
        3
    }

    async fn open_results_view(&mut self) -> Result<()> {
        self.in_results = true;
        Ok(())
    }

    async fn follow_next_page(&mut self) -> Result<bool> {
        let count = self.listing().map(Vec::len).unwrap_or(0);
        if self.page + 1 < count {
            self.page += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn marker(text: &str) -> String {
    format!(
        r#"<html><body><table><tr><td class="match"><div id="matched3">{}</div></td></tr></table></body></html>"#,
        text
    )
}

fn listing(rows: &[(&str, &str)], next: bool) -> String {
    let body: String = rows
        .iter()
        .map(|(id, date)| {
            format!(
                r#"<tr id="key_{}"><td><input type="checkbox"/></td><td>Quarterly note</td><td>{}</td></tr>"#,
                id, date
            )
        })
        .collect();
    format!(
        r#"<html><body>
        <table class="tablesorter bodyline">
            <thead><tr><th></th><th>Title</th><th>Date</th></tr></thead>
            <tbody>{}</tbody>
        </table>
        {}
        </body></html>"#,
        body,
        if next { r#"<a href="javascript:void(0)">Next</a>"# } else { "" }
    )
}

fn record(broker: &str, author: &str, analyst_id: &str) -> AnalystRecord {
    AnalystRecord {
        broker_name: Some(broker.to_string()),
        author: Some(author.to_string()),
        last_name: None,
        analyst_id: Some(analyst_id.to_string()),
        ibes_id: None,
    }
}

fn test_config(output: &std::path::Path, workers: usize) -> HarvestConfig {
    let mut config = HarvestConfig::default()
        .with_output_dir(output)
        .with_workers(workers);
    config.session.classify_timeout_secs = 1;
    config.session.poll_interval_ms = 10;
    config.session.page_pause_ms = 0;
    config.session.restart_pause_secs = 0;
    config.rate_limit.pacing = PacingConfig::disabled();
    config.fetch = FetchConfig {
        base_delay_ms: 0,
        max_delay_ms: 0,
        referer: None,
        ..Default::default()
    };
    config
}

#[tokio::test]
async fn test_roster_to_downloads() {
    let mut server = mockito::Server::new_async().await;
    let documents = server
        .mock("GET", mockito::Matcher::Regex(r"^/investextsearchlive\.php".to_string()))
        .with_status(200)
        .with_header("content-type", "application/pdf")
        .with_body("%PDF-1.4 test document")
        .expect(3)
        .create_async()
        .await;

    let mut pages = HashMap::new();
    pages.insert(
        "Acme Securities".to_string(),
        vec![
            listing(&[("5001", "02/03/2004"), ("5002", "07/08/2006")], true),
            listing(&[("5003", "11/12/2009")], false),
        ],
    );
    let portal = ScriptedPortal::new(pages);

    let output = tempfile::tempdir().unwrap();
    let mut config = test_config(output.path(), 2);
    config.portal.document_base_url = format!("{}/investextsearchlive.php", server.url());

    let roster = vec![
        record("0001 Acme Securities", "Jane Q Doe", "101"),
        record("0002 Beta Capital", "John Roe", "102"),
        record("", "Never Processed", "103"),
    ];
    let jobs = analyst_jobs(&roster, config.dates);
    assert_eq!(jobs.len(), 2);

    let launcher: Arc<dyn PortalLauncher> = portal.clone();
    let harvester = Harvester::from_config(&config, launcher).unwrap();
    let summary = harvester.process_all(&jobs).await;

    documents.assert_async().await;
    assert_eq!(summary.found(), 3);
    assert_eq!(summary.downloaded(), 3);
    assert_eq!(summary.failed(), 0);
    assert_eq!(summary.analysts[0].status, SearchStatus::Matched);
    assert_eq!(summary.analysts[1].status, SearchStatus::NoMatch);

    let directory = output.path().join("Acme Securities_101_Doe");
    for name in [
        "Acme Securities_101_Doe_3_2004.pdf",
        "Acme Securities_101_Doe_2_2006.pdf",
        "Acme Securities_101_Doe_1_2009.pdf",
    ] {
        assert!(directory.join(name).exists(), "missing {}", name);
    }

    // One session per analyst, each closed.
    assert_eq!(portal.launches.load(Ordering::SeqCst), 2);
    assert_eq!(portal.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_html_responses_are_not_saved() {
    let mut server = mockito::Server::new_async().await;
    let _login_page = server
        .mock("GET", mockito::Matcher::Regex(r"^/investextsearchlive\.php".to_string()))
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body("<html><body>Please sign in</body></html>")
        .create_async()
        .await;

    let mut pages = HashMap::new();
    pages.insert(
        "Acme Securities".to_string(),
        vec![listing(&[("6001", "01/01/2001")], false)],
    );
    let portal = ScriptedPortal::new(pages);

    let output = tempfile::tempdir().unwrap();
    let mut config = test_config(output.path(), 1);
    config.fetch.max_attempts = 2;
    config.portal.document_base_url = format!("{}/investextsearchlive.php", server.url());

    let jobs = analyst_jobs(&[record("1 Acme Securities", "Jane Doe", "7")], config.dates);
    let harvester = Harvester::from_config(&config, portal).unwrap();
    let summary = harvester.process_all(&jobs).await;

    assert_eq!(summary.found(), 1);
    assert_eq!(summary.downloaded(), 0);
    assert_eq!(summary.failed(), 1);

    let directory = output.path().join("Acme Securities_7_Doe");
    let leftovers: Vec<_> = std::fs::read_dir(&directory)
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
}

mod chrome_tests {
    use report_harvest::{
        browser_setup, ChromeConfig, ChromeLauncher, PortalConfig, PortalLauncher, PortalSession,
    };

    #[tokio::test]
    #[ignore]
    async fn test_chrome_session_launch_and_close() {
        if browser_setup::detect_chrome().is_none() {
            println!("Chrome not installed, skipping");
            return;
        }
        let launcher = ChromeLauncher::new(ChromeConfig::default(), PortalConfig::default());
        let mut session = launcher.launch().await.expect("launch");
        assert_eq!(session.result_row(), 3);
        session.close().await.expect("close");
        // Closing twice is a no-op.
        session.close().await.expect("second close");
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_portal_search() {
        // Requires an authenticated portal session reachable from this machine.
        use report_harvest::{SearchQuery, SearchSession, SessionConfig};
        use std::sync::Arc;

        let launcher = Arc::new(ChromeLauncher::new(
            ChromeConfig::default(),
            PortalConfig::default(),
        ));
        let session = SearchSession::new(launcher, SessionConfig::default());
        let query = SearchQuery::new("John", "Smith", "Morgan Stanley");
        let run = session.search(&query).await;
        println!(
            "Live search: {:?} after {} attempts, {} references",
            run.status,
            run.attempts,
            run.references.len()
        );
    }
}
