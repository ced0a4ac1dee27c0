//! Error types for the harvesting library.

use thiserror::Error;

/// Result type alias for harvesting operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Errors that can occur while searching the portal or fetching documents.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Failed to parse a page or response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Browser automation failed.
    #[error("Browser error: {0}")]
    Browser(String),

    /// A secondary window expected mid-form never opened.
    #[error("Lookup window '{0}' did not open in time")]
    PopupTimeout(String),

    /// Neither a match count nor an N/A marker appeared.
    #[error("No match count or N/A marker within {0}s")]
    ClassificationTimeout(u64),

    /// Downloaded content is not what was declared or expected.
    #[error("Content mismatch: {0}")]
    ContentMismatch(String),

    /// A document could not be retrieved within its attempt budget.
    #[error("Failed to fetch document after {attempts} attempts: {reason}")]
    FetchFailure { attempts: u32, reason: String },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl HarvestError {
    /// Wraps any displayable browser-side failure with context.
    pub(crate) fn browser(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Browser(format!("{}: {}", context, err))
    }
}
