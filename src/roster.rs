//! Analyst roster input.
//!
//! The roster is a JSON array exported from the analyst spreadsheet, one
//! object per row, keyed by the spreadsheet's column names.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::harvest::AnalystJob;
use crate::{DateRange, FileLabel, HarvestError, Result, SearchQuery};

/// Broker names used as-is instead of dropping their leading token.
const VERBATIM_BROKERS: &[&str] = &["BMO Capital Markets"];

/// One spreadsheet row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalystRecord {
    #[serde(rename = "report_broker_name", default)]
    pub broker_name: Option<String>,
    #[serde(rename = "report_author_clean", default)]
    pub author: Option<String>,
    #[serde(rename = "name_last", default)]
    pub last_name: Option<String>,
    #[serde(rename = "analys", default, deserialize_with = "text_or_number")]
    pub analyst_id: Option<String>,
    #[serde(rename = "IBES_id", default, deserialize_with = "text_or_number")]
    pub ibes_id: Option<String>,
}

/// Id columns come out of spreadsheet exports as either strings or numbers.
fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// Reads a roster file.
pub async fn load_roster(path: &Path) -> Result<Vec<AnalystRecord>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        HarvestError::Config(format!("cannot read roster {}: {}", path.display(), e))
    })?;
    let records: Vec<AnalystRecord> = serde_json::from_str(&content)?;
    debug!("Read {} roster rows from {}", records.len(), path.display());
    Ok(records)
}

/// Contributor name as the portal lists it: the broker name without its leading token.
pub fn contributor_name(broker: &str) -> String {
    let broker = broker.trim();
    if VERBATIM_BROKERS.contains(&broker) {
        return broker.to_string();
    }
    match broker.split_once(' ') {
        Some((_, rest)) => rest.trim().to_string(),
        None => broker.to_string(),
    }
}

/// First and last token of an author name; a single token serves as both.
pub fn split_author(author: &str) -> (String, String) {
    let parts: Vec<&str> = author.split_whitespace().collect();
    match parts.as_slice() {
        [] => (String::new(), String::new()),
        [only] => (only.to_string(), only.to_string()),
        [first, .., last] => (first.to_string(), last.to_string()),
    }
}

/// Builds one job per row, stopping at the first row without a broker name.
pub fn analyst_jobs(records: &[AnalystRecord], dates: DateRange) -> Vec<AnalystJob> {
    let mut jobs = Vec::new();
    for record in records {
        let broker = record.broker_name.as_deref().map(str::trim).unwrap_or_default();
        if broker.is_empty() {
            break;
        }
        let contributor = contributor_name(broker);

        let (first_name, author_last) = split_author(record.author.as_deref().unwrap_or_default());
        let last_name = record
            .last_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or(author_last);
        let analyst_id = record.analyst_id.clone().unwrap_or_default();

        jobs.push(AnalystJob {
            query: SearchQuery::new(first_name, last_name.clone(), contributor.clone())
                .with_dates(dates),
            label: FileLabel::new(contributor, analyst_id, last_name),
            ibes_id: record.ibes_id.clone().unwrap_or_default(),
        });
    }
    info!("Processed {} rows with valid broker names", jobs.len());
    jobs
}
