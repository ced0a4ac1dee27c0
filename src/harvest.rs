//! Batch driver: search every analyst, then download what was found.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, info_span, Instrument};

use crate::config::HarvestConfig;
use crate::fetcher::DocumentFetcher;
use crate::portal::PortalLauncher;
use crate::ratelimit::RateGate;
use crate::session::{SearchSession, SearchStatus};
use crate::{plan_downloads, FileLabel, HarvestError, Result, SearchQuery};

/// One analyst to harvest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalystJob {
    pub query: SearchQuery,
    /// Naming metadata for the analyst's files.
    pub label: FileLabel,
    /// I/B/E/S identifier from the roster; informational.
    pub ibes_id: String,
}

/// Per-analyst outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalystSummary {
    pub analyst: String,
    pub status: SearchStatus,
    /// References found across all result pages.
    pub found: usize,
    pub downloaded: usize,
    pub failed: usize,
}

/// Outcome of a whole run, in roster order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestSummary {
    pub analysts: Vec<AnalystSummary>,
}

impl HarvestSummary {
    pub fn found(&self) -> usize {
        self.analysts.iter().map(|a| a.found).sum()
    }

    pub fn downloaded(&self) -> usize {
        self.analysts.iter().map(|a| a.downloaded).sum()
    }

    pub fn failed(&self) -> usize {
        self.analysts.iter().map(|a| a.failed).sum()
    }

    /// Analysts whose search returned nothing, for whatever reason.
    pub fn without_reports(&self) -> usize {
        self.analysts.iter().filter(|a| a.found == 0).count()
    }
}

/// Runs searches and downloads for a list of analysts.
///
/// Each worker owns one [`DocumentFetcher`], so HTTP clients are never
/// shared between analysts in flight.
pub struct Harvester {
    search: SearchSession,
    fetchers: Vec<DocumentFetcher>,
    output_dir: PathBuf,
    document_base_url: String,
}

impl Harvester {
    /// Creates a harvester with one worker per fetcher.
    ///
    /// Fails when `fetchers` is empty.
    pub fn new(
        search: SearchSession,
        fetchers: Vec<DocumentFetcher>,
        output_dir: impl Into<PathBuf>,
        document_base_url: impl Into<String>,
    ) -> Result<Self> {
        if fetchers.is_empty() {
            return Err(HarvestError::Config(
                "a harvester needs at least one fetcher".to_string(),
            ));
        }
        Ok(Self {
            search,
            fetchers,
            output_dir: output_dir.into(),
            document_base_url: document_base_url.into(),
        })
    }

    /// Wires a harvester from configuration; all workers share one rate gate.
    pub fn from_config(config: &HarvestConfig, launcher: Arc<dyn PortalLauncher>) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(RateGate::new(config.rate_limit.clone()));
        let fetchers = (0..config.workers)
            .map(|_| {
                DocumentFetcher::new(config.fetch.clone())
                    .map(|fetcher| fetcher.with_rate_gate(Arc::clone(&gate)))
            })
            .collect::<Result<Vec<_>>>()?;
        let search = SearchSession::new(launcher, config.session.clone());

        Self::new(
            search,
            fetchers,
            config.output_dir.clone(),
            config.portal.document_base_url.clone(),
        )
    }

    /// Number of analysts processed concurrently.
    pub fn workers(&self) -> usize {
        self.fetchers.len()
    }

    /// Searches one analyst and downloads every listed document.
    pub async fn process_analyst(&self, job: &AnalystJob) -> AnalystSummary {
        self.run_job(job, &self.fetchers[0]).await
    }

    async fn run_job(&self, job: &AnalystJob, fetcher: &DocumentFetcher) -> AnalystSummary {
        let analyst = job.query.analyst_name();
        let span = info_span!("analyst", name = %analyst);

        async {
            info!("Processing analyst: {}", analyst);
            let run = self.search.search(&job.query).await;
            let status = run.status.clone();
            let references = run.into_references();

            let mut summary = AnalystSummary {
                analyst: analyst.clone(),
                status,
                found: references.len(),
                downloaded: 0,
                failed: 0,
            };
            if references.is_empty() {
                return summary;
            }

            let directory = self.output_dir.join(job.label.directory_name());
            let tasks = plan_downloads(&references, &self.document_base_url, &job.label);
            for task in &tasks {
                match fetcher.fetch(task, &directory).await {
                    Ok(path) => {
                        info!("Successfully downloaded: {}", path.display());
                        summary.downloaded += 1;
                    }
                    Err(e) => {
                        error!("Failed to download {}: {}", task.url, e);
                        summary.failed += 1;
                    }
                }
            }

            info!(
                "Finished {}: {} of {} documents downloaded",
                analyst, summary.downloaded, summary.found
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Processes `jobs` with one analyst in flight per worker.
    ///
    /// Workers pull the next job from a shared cursor; summaries come back in
    /// roster order.
    pub async fn process_all(&self, jobs: &[AnalystJob]) -> HarvestSummary {
        let total = jobs.len();
        info!("Processing {} analysts with {} workers", total, self.workers());

        let cursor = AtomicUsize::new(0);
        let lanes = self.fetchers.iter().map(|fetcher| {
            let cursor = &cursor;
            async move {
                let mut done = Vec::new();
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(index) else {
                        break;
                    };
                    info!("Analyst {}/{}", index + 1, total);
                    done.push((index, self.run_job(job, fetcher).await));
                }
                done
            }
        });

        let mut finished: Vec<(usize, AnalystSummary)> =
            join_all(lanes).await.into_iter().flatten().collect();
        finished.sort_by_key(|(index, _)| *index);

        let summary = HarvestSummary {
            analysts: finished.into_iter().map(|(_, summary)| summary).collect(),
        };
        info!(
            "Harvest complete: {} documents found, {} downloaded, {} failed",
            summary.found(),
            summary.downloaded(),
            summary.failed()
        );
        summary
    }
}
