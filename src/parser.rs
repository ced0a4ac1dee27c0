//! Result listing and response-marker parsing.
//!
//! Both functions work on a static HTML snapshot so they can be tested
//! without a browser.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::{HarvestError, Result, ReportReference};

/// Results table carrying one `key_<digits>` row per document.
const RESULTS_TABLE_SELECTOR: &str = "table.tablesorter.bodyline";

/// Zero-based column holding the `MM/DD/YYYY` publication date.
const DATE_COLUMN: usize = 2;

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| HarvestError::Parse(format!("Failed to parse selector: {:?}", e)))
}

/// One parsed results page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultPage {
    /// References in row order.
    pub reports: Vec<ReportReference>,
    /// Whether the page offers a "Next" pagination link.
    pub has_next: bool,
}

/// Parses one results page.
///
/// A page without the results table, or with a table lacking a body, is a
/// parse error rather than an empty page. Rows whose id is not
/// `key_<digits>` are skipped.
pub fn parse_results_page(html: &str) -> Result<ResultPage> {
    let document = Html::parse_document(html);

    let table_selector = selector(RESULTS_TABLE_SELECTOR)?;
    let body_selector = selector("tbody")?;
    let row_selector = selector("tr[id]")?;
    let cell_selector = selector("td")?;
    let next_selector = selector("a")?;
    let key_pattern = Regex::new(r"^key_(\d+)")
        .map_err(|e| HarvestError::Parse(format!("Failed to compile row pattern: {}", e)))?;

    let table = document
        .select(&table_selector)
        .next()
        .ok_or_else(|| HarvestError::Parse("results table not found".to_string()))?;
    let body = table
        .select(&body_selector)
        .next()
        .ok_or_else(|| HarvestError::Parse("results table has no body".to_string()))?;

    let mut reports = Vec::new();
    for row in body.select(&row_selector) {
        let row_id = row.value().attr("id").unwrap_or_default();
        let Some(captures) = key_pattern.captures(row_id) else {
            continue;
        };
        let document_id = captures[1].to_string();

        let Some(date_cell) = row.select(&cell_selector).nth(DATE_COLUMN) else {
            debug!("Row {} has no date column, skipping", row_id);
            continue;
        };
        reports.push(ReportReference::new(document_id, year_of(date_cell)));
    }

    let has_next = document
        .select(&next_selector)
        .any(|link| link.text().collect::<String>().contains("Next"));

    Ok(ResultPage { reports, has_next })
}

fn year_of(cell: ElementRef<'_>) -> String {
    let text = cell.text().collect::<String>();
    text.trim().rsplit('/').next().unwrap_or_default().trim().to_string()
}

/// Marker shown in the results area after a search is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMarker {
    /// "N Matches" marker; the count when it could be read.
    Matches(Option<u64>),
    /// Explicit "N/A" marker: the search legitimately found nothing.
    NotAvailable,
}

/// Looks for the match-count or N/A marker of criteria row `row`.
///
/// Returns `None` while neither marker is present.
pub fn classify_response(html: &str, row: u8) -> Result<Option<ResponseMarker>> {
    let document = Html::parse_document(html);
    let marker_selector = selector(&format!("td.match div#matched{}", row))?;

    for marker in document.select(&marker_selector) {
        let text = marker.text().collect::<String>();
        if text.contains("Matches") {
            let count = text
                .split_whitespace()
                .find_map(|word| word.replace(',', "").parse::<u64>().ok());
            return Ok(Some(ResponseMarker::Matches(count)));
        }
        if text.contains("N/A") {
            return Ok(Some(ResponseMarker::NotAvailable));
        }
    }

    Ok(None)
}
