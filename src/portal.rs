//! Portal session abstraction.
//!
//! The search state machine talks to the portal only through these traits.
//! `ChromeLauncher` drives a real browser; tests use scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{DateRange, Result, SearchQuery};

/// Filter criteria added to the advanced search form, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// Report style; selected through the REPORTSTYLE lookup window.
    ReportStyle,
    /// Second structural criterion; needs no extra interaction.
    Structure,
    /// Contributor; selected through the CONTRIBUTOR lookup window.
    Contributor,
    /// Author name fields.
    Author,
}

impl Criterion {
    /// The fixed order in which criteria are added.
    pub const SEQUENCE: [Criterion; 4] = [
        Criterion::ReportStyle,
        Criterion::Structure,
        Criterion::Contributor,
        Criterion::Author,
    ];

    /// Portal code passed to `addCriteria`.
    pub fn code(self) -> u8 {
        match self {
            Criterion::ReportStyle => 5,
            Criterion::Structure => 11,
            Criterion::Contributor => 8,
            Criterion::Author => 9,
        }
    }

    /// Lookup window name for criteria that open one.
    pub fn lookup_window(self) -> Option<&'static str> {
        match self {
            Criterion::ReportStyle => Some("REPORTSTYLE"),
            Criterion::Contributor => Some("CONTRIBUTOR"),
            Criterion::Structure | Criterion::Author => None,
        }
    }
}

/// Static description of the portal's pages and form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Advanced search entry page.
    pub search_url: String,
    /// Document download endpoint.
    pub document_base_url: String,
    /// Criteria group passed as the first `addCriteria` argument.
    pub criteria_group: u8,
    /// Criteria row holding the author fields, submit button and match marker.
    pub result_row: u8,
    /// Checkbox value selected in the report-style lookup.
    pub report_style_value: String,
    /// Whether to type the analyst's first name as well as the last name.
    pub fill_first_name: bool,
    /// Upper bound for waiting on a single form element, in seconds.
    pub step_timeout_secs: u64,
    /// Upper bound for a lookup window to open, in seconds.
    pub popup_timeout_secs: u64,
    /// Pause after each form action, in milliseconds.
    pub settle_ms: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            search_url: "https://www.mergentonline.com/investextfullsearch.php".to_string(),
            document_base_url: "https://www.mergentonline.com/investextsearchlive.php".to_string(),
            criteria_group: 1,
            result_row: 3,
            report_style_value: "150000018-EQUITY".to_string(),
            fill_first_name: false,
            step_timeout_secs: 15,
            popup_timeout_secs: 15,
            settle_ms: 1000,
        }
    }
}

/// One live portal session (one browser instance).
///
/// Every method blocks until its step completes or its own timeout fires.
/// `close` must be safe to call more than once.
#[async_trait]
pub trait PortalSession: Send {
    /// Navigates to the search entry page.
    async fn open_search_page(&mut self) -> Result<()>;

    /// Switches to a custom date range and fills both bounds.
    async fn set_date_range(&mut self, range: &DateRange) -> Result<()>;

    /// Adds one criterion, including any lookup-window interaction it needs.
    async fn add_criterion(&mut self, criterion: Criterion, query: &SearchQuery) -> Result<()>;

    /// Submits the search.
    async fn submit(&mut self) -> Result<()>;

    /// Snapshot of the current page's HTML.
    async fn page_html(&mut self) -> Result<String>;

    /// Criteria row whose marker reports the final match count.
    fn result_row(&self) -> u8;

    /// Opens the result listing after a successful search.
    async fn open_results_view(&mut self) -> Result<()>;

    /// Clicks the "Next" pagination link. Returns `false` if there is none.
    async fn follow_next_page(&mut self) -> Result<bool>;

    /// Tears the session down.
    async fn close(&mut self) -> Result<()>;
}

/// Creates a fresh, independent portal session per search attempt.
#[async_trait]
pub trait PortalLauncher: Send + Sync {
    /// Launches a new session.
    async fn launch(&self) -> Result<Box<dyn PortalSession>>;
}
