use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::api::SourceReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyStatus {
    Active,
    Inactive,
}

impl PropertyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyStatus::Active => "active",
            PropertyStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for PropertyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PropertyStatus::Active),
            "inactive" => Ok(PropertyStatus::Inactive),
            other => Err(format!("unknown property status '{}'", other)),
        }
    }
}

/// Bedroom bucket used for listing summaries; 0 is a studio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BedroomCount(pub u32);

impl fmt::Display for BedroomCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "Studio"),
            n => write!(f, "{}BHK", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub external_id: String,
    pub source: String,
    pub title: String,
    pub location_label: String,
    pub property_type: String,
    pub listing_type: String,
    pub price: f64,
    pub bedrooms: u32,
    pub bathrooms: Option<u32>,
    pub size_sqft: Option<f64>,
    pub url: Option<String>,
    pub status: PropertyStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub delisted_at: Option<DateTime<Utc>>,
}

impl Property {
    pub fn is_active(&self) -> bool {
        self.status == PropertyStatus::Active
    }

    pub fn bedroom_count(&self) -> BedroomCount {
        BedroomCount(self.bedrooms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub entry_id: i64,
    pub property_id: String,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Stored outcome of a monitoring run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Partial,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failure => "failure",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "partial" => Ok(RunOutcome::Partial),
            "failure" => Ok(RunOutcome::Failure),
            other => Err(format!("unknown run outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the run is still open.
    pub outcome: Option<RunOutcome>,
    pub new_count: u32,
    pub changed_count: u32,
    pub removed_count: u32,
    pub listings_seen: u32,
    pub sources_ok: u32,
    pub sources_failed: u32,
    pub error_detail: Option<String>,
}

/// Fetch-side figures recorded on the run row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunTally {
    pub listings_seen: u32,
    pub sources_ok: u32,
    pub sources_failed: u32,
    pub error_detail: Option<String>,
}

impl RunTally {
    pub fn from_reports(reports: &[SourceReport]) -> Self {
        let failures: Vec<String> = reports
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.source, e)))
            .collect();

        Self {
            listings_seen: reports.iter().map(|r| r.listings as u32).sum(),
            sources_ok: reports.iter().filter(|r| r.succeeded()).count() as u32,
            sources_failed: failures.len() as u32,
            error_detail: (!failures.is_empty()).then(|| failures.join("; ")),
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        match (self.sources_ok, self.sources_failed) {
            (0, _) => RunOutcome::Failure,
            (_, 0) => RunOutcome::Success,
            _ => RunOutcome::Partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListingEvent {
    NewListing {
        property: Property,
    },
    PriceChange {
        property: Property,
        old_price: f64,
        new_price: f64,
    },
    Delisting {
        property: Property,
    },
}

impl ListingEvent {
    pub fn property(&self) -> &Property {
        match self {
            ListingEvent::NewListing { property }
            | ListingEvent::PriceChange { property, .. }
            | ListingEvent::Delisting { property } => property,
        }
    }
}

/// What one reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub events: Vec<ListingEvent>,
    pub new_count: u32,
    pub changed_count: u32,
    pub removed_count: u32,
    pub relisted_count: u32,
    pub unchanged_count: u32,
    pub skipped_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    PartialSourceFailure,
    Aborted,
    StoreFailed(String),
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Completed | CycleOutcome::PartialSourceFailure
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::PartialSourceFailure => "partial_source_failure",
            CycleOutcome::Aborted => "aborted",
            CycleOutcome::StoreFailed(_) => "store_failed",
        }
    }
}

/// Everything the notifier needs about one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub events: Vec<ListingEvent>,
    pub listing_counts: BTreeMap<BedroomCount, usize>,
    pub sources: Vec<SourceReport>,
    pub consecutive_failures: u32,
}

impl CycleResult {
    pub fn new_listings(&self) -> usize {
        self.count(|e| matches!(e, ListingEvent::NewListing { .. }))
    }

    pub fn price_changes(&self) -> usize {
        self.count(|e| matches!(e, ListingEvent::PriceChange { .. }))
    }

    pub fn delistings(&self) -> usize {
        self.count(|e| matches!(e, ListingEvent::Delisting { .. }))
    }

    /// e.g. `"2 of 2BHK & 0 of 3BHK"`.
    pub fn listing_summary(&self) -> String {
        if self.listing_counts.is_empty() {
            return "no listings tracked".to_string();
        }
        self.listing_counts
            .iter()
            .map(|(bedrooms, count)| format!("{} of {}", count, bedrooms))
            .collect::<Vec<_>>()
            .join(" & ")
    }

    fn count<F: Fn(&ListingEvent) -> bool>(&self, predicate: F) -> usize {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

/// Cycle state machine: `Idle → Fetching → (Reconciling → Completed | Aborted) → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Fetching,
    Reconciling,
    Completed,
    Aborted,
}

/// Health counters owned by the engine and handed out by value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub consecutive_failures: u32,
    pub last_outcome: Option<CycleOutcome>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_cycles: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChangeRecord {
    pub property_id: String,
    pub title: String,
    pub old_price: f64,
    pub new_price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Changes recorded since a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub new: Vec<Property>,
    pub price_changes: Vec<PriceChangeRecord>,
    pub delisted: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_properties: usize,
    pub active_properties: usize,
    pub inactive_properties: usize,
    pub last_check: Option<DateTime<Utc>>,
    pub new_last_24h: usize,
    pub price_changes_last_24h: usize,
    pub delisted_last_24h: usize,
}
