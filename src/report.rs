//! Report references and the download tasks derived from them.

use serde::{Deserialize, Serialize};

/// One document found in a result listing.
///
/// Carries no identity beyond `document_id`; the same id may appear on
/// several pages and is kept as many times as it is listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReference {
    /// Opaque document token issued by the portal.
    pub document_id: String,
    /// Four-digit publication year.
    pub year: String,
}

impl ReportReference {
    /// Creates a new reference.
    pub fn new(document_id: impl Into<String>, year: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            year: year.into(),
        }
    }
}

/// Analyst metadata used to name downloaded files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLabel {
    /// Company name placed first in file names.
    pub company_name: String,
    /// Analyst identifier.
    pub analyst_id: String,
    /// Analyst last name; only the part before the first comma is used.
    pub last_name: String,
}

impl FileLabel {
    /// Creates a new label.
    pub fn new(
        company_name: impl Into<String>,
        analyst_id: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        Self {
            company_name: company_name.into(),
            analyst_id: analyst_id.into(),
            last_name: last_name.into(),
        }
    }

    /// `{company}_{analystId}_{lastName}`, the per-analyst output directory.
    pub fn directory_name(&self) -> String {
        format!(
            "{}_{}_{}",
            sanitize_component(&self.company_name),
            sanitize_component(&self.analyst_id),
            self.short_last_name()
        )
    }

    fn short_last_name(&self) -> String {
        sanitize_component(self.last_name.split(',').next().unwrap_or_default().trim())
    }
}

/// A single document to retrieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Document URL.
    pub url: String,
    /// Naming metadata.
    pub label: FileLabel,
    /// Descending ordinal within the analyst's result set; the first listed report gets the highest.
    pub file_num: usize,
    /// Publication year.
    pub year: String,
}

impl DownloadTask {
    /// `{company}_{analystId}_{lastName}_{fileNum}_{year}.{extension}`.
    pub fn file_name(&self, extension: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}.{}",
            sanitize_component(&self.label.company_name),
            sanitize_component(&self.label.analyst_id),
            self.label.short_last_name(),
            self.file_num,
            sanitize_component(&self.year),
            extension
        )
    }
}

/// Keeps alphanumerics, `.`, `_`, `-` and spaces.
pub fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect::<String>()
        .trim()
        .to_string()
}

/// URL of the document endpoint for one document id.
pub fn document_url(base_url: &str, document_id: &str) -> String {
    let docid = format!("[\"{}\"]", document_id);
    format!(
        "{}?opt=loadDocument&docid={}&doctype=pdf",
        base_url,
        urlencoding::encode(&docid)
    )
}

/// Turns a listing into download tasks, numbering them `total..=1` in listing order.
pub fn plan_downloads(
    references: &[ReportReference],
    base_url: &str,
    label: &FileLabel,
) -> Vec<DownloadTask> {
    let total = references.len();
    references
        .iter()
        .enumerate()
        .map(|(index, reference)| DownloadTask {
            url: document_url(base_url, &reference.document_id),
            label: label.clone(),
            file_num: total - index,
            year: reference.year.clone(),
        })
        .collect()
}
