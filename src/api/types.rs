use serde::{Deserialize, Serialize};

/// One listing record as returned by a source, after field mapping but
/// before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub location: String,
    pub property_type: String,
    pub listing_type: String,
    pub price: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub size_sqft: Option<f64>,
    pub url: Option<String>,
}

/// Query for one source feed. Immutable for the duration of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingQuery {
    pub source: String,
    /// Source-specific area filter (location external ids, a location slug).
    pub area_filter: String,
    pub purpose: Option<String>,
    pub page_size: u32,
    pub max_pages: u32,
}

impl ListingQuery {
    pub fn new(source: &str, area_filter: &str) -> Self {
        Self {
            source: source.to_string(),
            area_filter: area_filter.to_string(),
            purpose: None,
            page_size: 50,
            max_pages: 10,
        }
    }

    pub fn with_purpose(mut self, purpose: &str) -> Self {
        self.purpose = Some(purpose.to_string());
        self
    }

    pub fn with_paging(mut self, page_size: u32, max_pages: u32) -> Self {
        self.page_size = page_size;
        self.max_pages = max_pages;
        self
    }

    /// Label used in per-source tallies and logs, e.g. `uae_real_estate/for-rent`.
    pub fn label(&self) -> String {
        match &self.purpose {
            Some(purpose) => format!("{}/{}", self.source, purpose),
            None => self.source.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), FetchError> {
        if self.source.trim().is_empty() {
            return Err(FetchError::Rejected("query has no source".to_string()));
        }
        if self.area_filter.trim().is_empty() {
            return Err(FetchError::Rejected(format!(
                "query for {} has an empty area filter",
                self.source
            )));
        }
        if self.page_size == 0 || self.max_pages == 0 {
            return Err(FetchError::Rejected(format!(
                "query for {} has zero page size or page count",
                self.source
            )));
        }
        Ok(())
    }
}

/// Listings parsed from one page, plus the number of records the page held
/// before unusable ones were dropped (drives the paging stop condition).
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub listings: Vec<RawListing>,
    pub raw_count: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Per-source outcome of one cycle's fetch phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub listings: usize,
    pub error: Option<String>,
}

impl SourceReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
