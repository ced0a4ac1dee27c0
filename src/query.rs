//! Search query representation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{HarvestError, Result};

/// Date format the portal's range fields expect.
const PORTAL_DATE_FORMAT: &str = "%m/%d/%Y";

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

/// Inclusive publication date range applied to a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First publication date included.
    pub from: NaiveDate,
    /// Last publication date included.
    pub to: NaiveDate,
}

impl DateRange {
    /// Creates a range, rejecting one that ends before it starts.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self> {
        if to < from {
            return Err(HarvestError::Config(format!(
                "date range ends ({}) before it starts ({})",
                to, from
            )));
        }
        Ok(Self { from, to })
    }

    /// Range from 1999-01-01 through December 31st of `cutoff_year`.
    pub fn through_year_end(cutoff_year: i32) -> Result<Self> {
        let to = NaiveDate::from_ymd_opt(cutoff_year, 12, 31)
            .ok_or_else(|| HarvestError::Config(format!("invalid cutoff year {}", cutoff_year)))?;
        Self::new(ymd(1999, 1, 1), to)
    }

    /// Start date as typed into the portal form.
    pub fn portal_from(&self) -> String {
        self.from.format(PORTAL_DATE_FORMAT).to_string()
    }

    /// End date as typed into the portal form.
    pub fn portal_to(&self) -> String {
        self.to.format(PORTAL_DATE_FORMAT).to_string()
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self {
            from: ymd(1999, 1, 1),
            to: ymd(2022, 12, 31),
        }
    }
}

/// One analyst/contributor search. Immutable for the lifetime of a session attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Analyst first name.
    pub first_name: String,
    /// Analyst last name.
    pub last_name: String,
    /// Contributor (brokerage) name used in the contributor lookup.
    pub contributor: String,
    /// Publication date range.
    pub dates: DateRange,
}

impl SearchQuery {
    /// Creates a query with the default date range.
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        contributor: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            contributor: contributor.into(),
            dates: DateRange::default(),
        }
    }

    /// Sets the date range.
    pub fn with_dates(mut self, dates: DateRange) -> Self {
        self.dates = dates;
        self
    }

    /// "First Last" for log lines.
    pub fn analyst_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}
