//! # report-harvest
//!
//! Harvests analyst research reports from a subscription research portal.
//!
//! For every analyst the library drives a headless Chrome through the
//! portal's multi-step advanced search form, reads the paginated result
//! listing, and downloads each listed document over HTTP under a shared
//! request budget.
//!
//! - [`SearchSession`] runs the form protocol with a bounded restart policy
//! - [`parse_results_page`] extracts document ids and years from a listing
//! - [`DocumentFetcher`] downloads with retries, backoff and content checks
//! - [`RateGate`] enforces a sliding-window budget with randomized pacing
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use report_harvest::{ChromeConfig, ChromeLauncher, PortalConfig, SearchQuery, SearchSession, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let launcher = Arc::new(ChromeLauncher::new(ChromeConfig::default(), PortalConfig::default()));
//!     let session = SearchSession::new(launcher, SessionConfig::default());
//!
//!     let query = SearchQuery::new("Jane", "Doe", "Acme Securities");
//!     for report in session.search(&query).await.into_references() {
//!         println!("{} ({})", report.document_id, report.year);
//!     }
//! }
//! ```

mod error;
mod query;
mod report;

pub mod browser;
pub mod browser_setup;
pub mod config;
pub mod fetcher;
pub mod harvest;
pub mod parser;
pub mod portal;
pub mod ratelimit;
pub mod roster;
pub mod session;

pub use browser::{ChromeConfig, ChromeLauncher, ChromeSession, LaunchProfile};
pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
pub use fetcher::{DocumentFetcher, FetchConfig};
pub use harvest::{AnalystJob, AnalystSummary, HarvestSummary, Harvester};
pub use parser::{classify_response, parse_results_page, ResponseMarker, ResultPage};
pub use portal::{Criterion, PortalConfig, PortalLauncher, PortalSession};
pub use query::{DateRange, SearchQuery};
pub use ratelimit::{PacingConfig, RateGate, RateLimitConfig, SlidingWindow};
pub use report::{
    document_url, plan_downloads, sanitize_component, DownloadTask, FileLabel, ReportReference,
};
pub use roster::{analyst_jobs, load_roster, AnalystRecord};
pub use session::{RetryState, SearchOutcome, SearchRun, SearchSession, SearchStatus, SessionConfig};
