//! Search state machine.
//!
//! One `SearchSession::search` call runs a query end to end: it launches a
//! portal session, fills the form, classifies the response and paginates the
//! listing. An ambiguous response (no marker before the timeout) restarts
//! the whole protocol with a fresh session, up to a bounded number of
//! attempts. Every launched session is closed before the attempt returns.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::parser::{classify_response, parse_results_page, ResponseMarker};
use crate::portal::{Criterion, PortalLauncher, PortalSession};
use crate::{HarvestError, ReportReference, Result, SearchQuery};

/// Retry and pagination policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Retry ceiling: total attempts per query.
    pub max_attempts: u32,
    /// An extended cooldown precedes every attempt whose number is a multiple of this.
    pub cooldown_every: u32,
    pub cooldown_secs: u64,
    /// Pause before relaunching after an ambiguous attempt.
    pub restart_pause_secs: u64,
    /// How long to wait for the match-count or N/A marker.
    pub classify_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Upper bound on result pages read per query.
    pub max_pages: usize,
    pub page_pause_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cooldown_every: 5,
            cooldown_secs: 120,
            restart_pause_secs: 2,
            classify_timeout_secs: 100,
            poll_interval_ms: 500,
            max_pages: 500,
            page_pause_ms: 2000,
        }
    }
}

/// Result of one search attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The portal reported matches; references from every page.
    Matched(Vec<ReportReference>),
    /// The portal explicitly reported no results.
    NoMatch,
    /// Neither marker appeared before the classification timeout.
    Ambiguous,
}

/// Attempt counter for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    query: SearchQuery,
}

impl RetryState {
    /// State for the first attempt.
    pub fn first(query: SearchQuery) -> Self {
        Self { attempt: 1, query }
    }

    /// State for the following attempt.
    pub fn next(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            query: self.query,
        }
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Whether this attempt must be preceded by the extended cooldown.
    pub fn needs_cooldown(&self, every: u32) -> bool {
        self.attempt > 1 && every > 0 && self.attempt % every == 0
    }

    /// Whether no attempt remains after this one.
    pub fn is_last(&self, max_attempts: u32) -> bool {
        self.attempt >= max_attempts
    }
}

/// How a query ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStatus {
    Matched,
    NoMatch,
    /// Every attempt was ambiguous.
    Exhausted,
    /// An attempt failed outright (launch, form step, lookup window, ...).
    Failed(String),
}

/// Everything a finished query produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRun {
    pub references: Vec<ReportReference>,
    pub status: SearchStatus,
    /// Attempts made, including the final one.
    pub attempts: u32,
    /// Extended cooldowns taken.
    pub cooldowns: u32,
}

impl SearchRun {
    /// The references, empty unless the query matched.
    pub fn into_references(self) -> Vec<ReportReference> {
        self.references
    }
}

/// Runs queries against the portal.
pub struct SearchSession {
    launcher: Arc<dyn PortalLauncher>,
    config: SessionConfig,
}

impl SearchSession {
    /// Creates a session runner over `launcher`.
    pub fn new(launcher: Arc<dyn PortalLauncher>, config: SessionConfig) -> Self {
        Self { launcher, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs `query` to completion. Never fails: errors become an empty run.
    pub async fn search(&self, query: &SearchQuery) -> SearchRun {
        let analyst = query.analyst_name();
        let max_attempts = self.config.max_attempts.max(1);
        let mut state = RetryState::first(query.clone());
        let mut cooldowns = 0;

        loop {
            if state.attempt() > 1 {
                if state.needs_cooldown(self.config.cooldown_every) {
                    info!(
                        "Attempt {} for {}: cooling down for {}s",
                        state.attempt(),
                        analyst,
                        self.config.cooldown_secs
                    );
                    tokio::time::sleep(Duration::from_secs(self.config.cooldown_secs)).await;
                    cooldowns += 1;
                }
                tokio::time::sleep(Duration::from_secs(self.config.restart_pause_secs)).await;
            }

            debug!("Search attempt {} for {}", state.attempt(), analyst);
            let run = |references, status| SearchRun {
                references,
                status,
                attempts: state.attempt(),
                cooldowns,
            };

            match self.attempt(&state).await {
                Ok(SearchOutcome::Matched(references)) => {
                    info!("Found {} reports for {}", references.len(), analyst);
                    return run(references, SearchStatus::Matched);
                }
                Ok(SearchOutcome::NoMatch) => {
                    warn!("No reports found for {}", analyst);
                    return run(Vec::new(), SearchStatus::NoMatch);
                }
                Ok(SearchOutcome::Ambiguous) if state.is_last(max_attempts) => {
                    error!(
                        "Giving up on {} after {} ambiguous attempts",
                        analyst,
                        state.attempt()
                    );
                    return run(Vec::new(), SearchStatus::Exhausted);
                }
                Ok(SearchOutcome::Ambiguous) => {
                    warn!(
                        "Attempt {} for {} was ambiguous, restarting search",
                        state.attempt(),
                        analyst
                    );
                }
                Err(e) => {
                    error!("Search for {} failed: {}", analyst, e);
                    return run(Vec::new(), SearchStatus::Failed(e.to_string()));
                }
            }

            state = state.next();
        }
    }

    /// One attempt in a fresh portal session.
    async fn attempt(&self, state: &RetryState) -> Result<SearchOutcome> {
        let mut session = self.launcher.launch().await?;
        let outcome = self.drive(session.as_mut(), state.query()).await;
        if let Err(e) = session.close().await {
            warn!("Failed to close portal session: {}", e);
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn PortalSession,
        query: &SearchQuery,
    ) -> Result<SearchOutcome> {
        session.open_search_page().await?;
        session.set_date_range(&query.dates).await?;
        for criterion in Criterion::SEQUENCE {
            session.add_criterion(criterion, query).await?;
        }
        session.submit().await?;

        match self.await_marker(session).await? {
            Some(ResponseMarker::Matches(count)) => {
                debug!("Portal reports {:?} matches", count);
                let references = self.paginate(session).await?;
                Ok(SearchOutcome::Matched(references))
            }
            Some(ResponseMarker::NotAvailable) => Ok(SearchOutcome::NoMatch),
            None => Ok(SearchOutcome::Ambiguous),
        }
    }

    /// Polls the page until a marker shows up or the timeout passes.
    async fn await_marker(&self, session: &mut dyn PortalSession) -> Result<Option<ResponseMarker>> {
        let row = session.result_row();
        let deadline = Instant::now() + Duration::from_secs(self.config.classify_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut read_once = false;
        let mut last_error = None;

        loop {
            match session.page_html().await {
                Ok(html) => {
                    read_once = true;
                    if let Some(marker) = classify_response(&html, row)? {
                        return Ok(Some(marker));
                    }
                }
                Err(e) => {
                    debug!("Page not readable yet: {}", e);
                    last_error = Some(e);
                }
            }
            if Instant::now() >= deadline {
                // A page that never became readable is a broken session, not an ambiguous answer.
                if let (false, Some(e)) = (read_once, last_error) {
                    return Err(e);
                }
                warn!(
                    "{}",
                    HarvestError::ClassificationTimeout(self.config.classify_timeout_secs)
                );
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Reads every result page, following "Next" up to the page cap.
    async fn paginate(&self, session: &mut dyn PortalSession) -> Result<Vec<ReportReference>> {
        session.open_results_view().await?;

        let mut references = Vec::new();
        let mut pages = 0;
        loop {
            let html = session.page_html().await?;
            pages += 1;
            match parse_results_page(&html) {
                Ok(page) => {
                    debug!("Page {}: {} reports", pages, page.reports.len());
                    references.extend(page.reports);
                    if !page.has_next {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Stopping at page {}: {}", pages, e);
                    break;
                }
            }

            if pages >= self.config.max_pages {
                warn!("Reached the page limit of {}", self.config.max_pages);
                break;
            }
            if !session.follow_next_page().await? {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.page_pause_ms)).await;
        }

        Ok(references)
    }
}
