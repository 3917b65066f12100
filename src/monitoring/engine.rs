use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::database::PropertyStore;
use super::normalize::{clean_listing, dedup_last_wins, matches_target, property_id, validate};
use super::types::{CycleOutcome, CyclePhase, CycleResult, HealthState, ListingEvent, RunTally};
use crate::api::{ListingFetcher, ListingQuery, RawListing, SourceReport};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queries: Vec<ListingQuery>,
    /// Locations that count as the monitored area; empty accepts everything.
    pub target_locations: Vec<String>,
    /// Upper bound on the fetch phase of one cycle.
    pub cycle_timeout: Duration,
}

/// Runs monitoring cycles: fetch every query, normalize, reconcile.
///
/// Cycles are serialized; a second caller waits for the running cycle to
/// finish. Health counters live here and are handed out by value.
pub struct ChangeEngine {
    fetcher: Arc<dyn ListingFetcher>,
    store: Arc<PropertyStore>,
    config: EngineConfig,
    health: RwLock<HealthState>,
    phase: RwLock<CyclePhase>,
    cycle_lock: Mutex<()>,
}

impl ChangeEngine {
    pub fn new(fetcher: Arc<dyn ListingFetcher>, store: Arc<PropertyStore>, config: EngineConfig) -> Self {
        Self {
            fetcher,
            store,
            config,
            health: RwLock::new(HealthState::default()),
            phase: RwLock::new(CyclePhase::Idle),
            cycle_lock: Mutex::new(()),
        }
    }

    pub async fn run_cycle(&self) -> CycleResult {
        let _cycle = self.cycle_lock.lock().await;
        let started_at = Utc::now();

        info!("🔄 Monitoring cycle starting ({} queries)", self.config.queries.len());

        let run_id = match self.store.begin_run(started_at).await {
            Ok(run_id) => run_id,
            Err(e) => {
                error!("❌ Could not open a run record: {}", e);
                let outcome = CycleOutcome::StoreFailed(e.to_string());
                self.record_outcome(&outcome).await;
                return self
                    .finish(String::new(), started_at, outcome, Vec::new(), Vec::new())
                    .await;
            }
        };

        self.set_phase(CyclePhase::Fetching).await;
        let (reports, listings) = self.fetch_all().await;
        let tally = RunTally::from_reports(&reports);

        if tally.sources_ok == 0 {
            self.set_phase(CyclePhase::Aborted).await;
            let detail = tally
                .error_detail
                .clone()
                .unwrap_or_else(|| "no sources configured".to_string());
            error!("🛑 Cycle aborted, every source failed: {}", detail);

            if let Err(e) = self.store.finish_run_failed(&run_id, &tally, &detail).await {
                error!("❌ Could not record failed run {}: {}", run_id, e);
            }

            self.record_outcome(&CycleOutcome::Aborted).await;
            return self
                .finish(run_id, started_at, CycleOutcome::Aborted, Vec::new(), reports)
                .await;
        }

        if tally.sources_failed > 0 {
            warn!(
                "⚠️  {} of {} queries failed, reconciling with the rest",
                tally.sources_failed,
                reports.len()
            );
        }

        self.set_phase(CyclePhase::Reconciling).await;
        let snapshot = self.normalize(listings);

        let (outcome, events) = match self.store.reconcile(&run_id, &snapshot, &tally).await {
            Ok(result) => {
                let outcome = if tally.sources_failed == 0 {
                    CycleOutcome::Completed
                } else {
                    CycleOutcome::PartialSourceFailure
                };
                self.set_phase(CyclePhase::Completed).await;
                (outcome, result.events)
            }
            Err(e) => {
                error!("❌ Reconcile failed, state left unchanged: {}", e);
                // Reconcile was attempted, so the cycle still ends in Completed
                self.set_phase(CyclePhase::Completed).await;

                if let Err(finish_err) = self
                    .store
                    .finish_run_failed(&run_id, &tally, &e.to_string())
                    .await
                {
                    error!("❌ Could not record failed run {}: {}", run_id, finish_err);
                }
                (CycleOutcome::StoreFailed(e.to_string()), Vec::new())
            }
        };

        self.record_outcome(&outcome).await;
        self.finish(run_id, started_at, outcome, events, reports).await
    }

    /// Clean, validate, keep only the monitored area and collapse duplicate ids.
    pub fn normalize(&self, listings: Vec<RawListing>) -> Vec<RawListing> {
        let total = listings.len();
        let mut invalid = 0usize;
        let mut outside = 0usize;

        let keyed: Vec<(String, RawListing)> = listings
            .iter()
            .filter_map(|raw| {
                let listing = clean_listing(raw);

                let issues = validate(&listing);
                if !issues.is_empty() {
                    invalid += 1;
                    warn!(
                        "⚠️  Dropping {} listing {}: {}",
                        listing.source,
                        listing.external_id,
                        issues.join(", ")
                    );
                    return None;
                }

                if !matches_target(&listing.location, &self.config.target_locations) {
                    outside += 1;
                    debug!("Outside monitored area: {}", listing.location);
                    return None;
                }

                let id = property_id(
                    &listing.external_id,
                    &listing.location,
                    listing.bedrooms.unwrap_or(0),
                    listing.size_sqft,
                );
                Some((id, listing))
            })
            .collect();

        let snapshot: Vec<RawListing> = dedup_last_wins(keyed, |(id, _)| id.clone())
            .into_iter()
            .map(|(_, listing)| listing)
            .collect();

        info!(
            "🧹 Normalized {} fetched listings: {} kept, {} invalid, {} outside area, {} duplicates",
            total,
            snapshot.len(),
            invalid,
            outside,
            total - invalid - outside - snapshot.len()
        );

        snapshot
    }

    pub async fn health(&self) -> HealthState {
        self.health.read().await.clone()
    }

    pub async fn phase(&self) -> CyclePhase {
        *self.phase.read().await
    }

    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    async fn fetch_all(&self) -> (Vec<SourceReport>, Vec<RawListing>) {
        let fetches = self.config.queries.iter().map(|query| async move {
            let result = self.fetcher.fetch(query).await;
            (query, result)
        });

        let results = match tokio::time::timeout(self.config.cycle_timeout, join_all(fetches)).await {
            Ok(results) => results,
            Err(_) => {
                error!("⏰ Fetch phase exceeded {:?}", self.config.cycle_timeout);
                let reports = self
                    .config
                    .queries
                    .iter()
                    .map(|query| SourceReport {
                        source: query.label(),
                        listings: 0,
                        error: Some(format!("cycle timed out after {:?}", self.config.cycle_timeout)),
                    })
                    .collect();
                return (reports, Vec::new());
            }
        };

        let mut reports = Vec::with_capacity(results.len());
        let mut listings = Vec::new();

        for (query, result) in results {
            match result {
                Ok(batch) => {
                    info!("📥 {}: {} listings", query.label(), batch.len());
                    reports.push(SourceReport {
                        source: query.label(),
                        listings: batch.len(),
                        error: None,
                    });
                    listings.extend(batch);
                }
                Err(e) => {
                    warn!("⚠️  {} failed: {}", query.label(), e);
                    reports.push(SourceReport {
                        source: query.label(),
                        listings: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        (reports, listings)
    }

    async fn record_outcome(&self, outcome: &CycleOutcome) {
        let mut health = self.health.write().await;
        health.total_cycles += 1;

        if outcome.is_success() {
            health.consecutive_failures = 0;
            health.last_success_at = Some(Utc::now());
        } else if *outcome == CycleOutcome::Aborted {
            health.consecutive_failures += 1;
        }
        // A store failure leaves the fetch streak untouched: the sources answered
        health.last_outcome = Some(outcome.clone());
    }

    async fn finish(
        &self,
        run_id: String,
        started_at: DateTime<Utc>,
        outcome: CycleOutcome,
        events: Vec<ListingEvent>,
        sources: Vec<SourceReport>,
    ) -> CycleResult {
        let listing_counts = match self.store.current_listing_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("⚠️  Could not read listing counts: {}", e);
                BTreeMap::new()
            }
        };
        let consecutive_failures = self.health.read().await.consecutive_failures;
        self.set_phase(CyclePhase::Idle).await;

        let result = CycleResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            events,
            listing_counts,
            sources,
            consecutive_failures,
        };

        info!(
            "📊 Cycle {}: {} new, {} price changes, {} delisted | {}",
            result.outcome.label(),
            result.new_listings(),
            result.price_changes(),
            result.delistings(),
            result.listing_summary()
        );

        result
    }

    async fn set_phase(&self, phase: CyclePhase) {
        debug!("Cycle phase → {:?}", phase);
        *self.phase.write().await = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FetchError, MockListingFetcher};
    use crate::monitoring::types::{BedroomCount, RunOutcome};
    use async_trait::async_trait;

    const AREA: &str = "Ras Al Khor Industrial Area 3";

    fn raw(source: &str, external_id: &str, bedrooms: u32, price: f64) -> RawListing {
        RawListing {
            source: source.to_string(),
            external_id: external_id.to_string(),
            title: format!("{} BR unit {}", bedrooms, external_id),
            location: format!("Dubai, {}", AREA),
            price: Some(price),
            bedrooms: Some(bedrooms),
            size_sqft: Some(900.0),
            ..Default::default()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            queries: vec![
                ListingQuery::new("a", "5003"),
                ListingQuery::new("b", "5003"),
            ],
            target_locations: vec![AREA.to_string()],
            cycle_timeout: Duration::from_secs(5),
        }
    }

    async fn engine_with(fetcher: MockListingFetcher) -> ChangeEngine {
        let store = Arc::new(PropertyStore::in_memory().await.unwrap());
        ChangeEngine::new(Arc::new(fetcher), store, config())
    }

    fn exhausted() -> FetchError {
        FetchError::Exhausted {
            attempts: 4,
            last: "HTTP 503 Service Unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn test_one_source_failing_still_reconciles_the_other() {
        let mut fetcher = MockListingFetcher::new();
        fetcher.expect_fetch().returning(|query: &ListingQuery| {
            if query.source == "a" {
                Err(exhausted())
            } else {
                Ok(vec![raw("b", "B1", 2, 90_000.0)])
            }
        });
        let engine = engine_with(fetcher).await;

        let result = engine.run_cycle().await;

        assert_eq!(result.outcome, CycleOutcome::PartialSourceFailure);
        assert_eq!(result.new_listings(), 1);
        assert_eq!(result.consecutive_failures, 0);
        assert_eq!(result.sources.len(), 2);
        assert!(!result.sources[0].succeeded());

        let run = engine.store().get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Partial));
        assert_eq!(run.sources_failed, 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing_aborts_without_touching_state() {
        let mut fetcher = MockListingFetcher::new();
        let mut calls = 0;
        fetcher.expect_fetch().returning(move |_| {
            calls += 1;
            // First cycle seeds state, later cycles fail everywhere
            if calls <= 2 {
                Ok(vec![raw("a", "P1", 2, 500_000.0)])
            } else {
                Err(exhausted())
            }
        });
        let engine = engine_with(fetcher).await;

        let seeded = engine.run_cycle().await;
        assert_eq!(seeded.outcome, CycleOutcome::Completed);
        let before = engine.store().active_properties().await.unwrap();

        let first = engine.run_cycle().await;
        let second = engine.run_cycle().await;

        assert_eq!(first.outcome, CycleOutcome::Aborted);
        assert!(first.events.is_empty());
        assert_eq!(first.consecutive_failures, 1);
        assert_eq!(second.consecutive_failures, 2);
        assert_eq!(engine.store().active_properties().await.unwrap(), before);

        let run = engine.store().get_run(&second.run_id).await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failure));
        assert!(run.error_detail.unwrap().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let mut fetcher = MockListingFetcher::new();
        let mut calls = 0;
        fetcher.expect_fetch().returning(move |_| {
            calls += 1;
            if calls <= 2 {
                Err(exhausted())
            } else {
                Ok(Vec::new())
            }
        });
        let engine = engine_with(fetcher).await;

        engine.run_cycle().await;
        assert_eq!(engine.health().await.consecutive_failures, 1);

        let result = engine.run_cycle().await;
        assert_eq!(result.outcome, CycleOutcome::Completed);

        let health = engine.health().await;
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_cycles, 2);
        assert!(health.last_success_at.is_some());
        assert_eq!(engine.phase().await, CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_cycle_reports_changes_and_counts() {
        let mut fetcher = MockListingFetcher::new();
        let mut cycle = 0;
        fetcher.expect_fetch().returning(move |query: &ListingQuery| {
            if query.source == "b" {
                return Ok(Vec::new());
            }
            cycle += 1;
            if cycle == 1 {
                Ok(vec![raw("a", "P1", 2, 500_000.0), raw("a", "P2", 3, 700_000.0)])
            } else {
                Ok(vec![raw("a", "P1", 2, 520_000.0), raw("a", "P3", 2, 650_000.0)])
            }
        });
        let engine = engine_with(fetcher).await;

        engine.run_cycle().await;
        let result = engine.run_cycle().await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        assert!(matches!(
            &result.events[0],
            ListingEvent::PriceChange { old_price, new_price, .. } if *old_price == 500_000.0 && *new_price == 520_000.0
        ));
        assert!(matches!(&result.events[1], ListingEvent::NewListing { property } if property.external_id == "P3"));
        assert!(matches!(&result.events[2], ListingEvent::Delisting { property } if property.external_id == "P2"));
        assert_eq!(result.listing_counts.get(&BedroomCount(2)), Some(&2));
        assert_eq!(result.listing_counts.get(&BedroomCount(3)), Some(&0));
        assert_eq!(result.listing_summary(), "2 of 2BHK & 0 of 3BHK");
    }

    #[tokio::test]
    async fn test_normalize_filters_area_and_duplicates() {
        let engine = engine_with(MockListingFetcher::new()).await;
        let mut elsewhere = raw("a", "X1", 1, 60_000.0);
        elsewhere.location = "Dubai Marina".to_string();
        let mut unpriced = raw("a", "X2", 1, 0.0);
        unpriced.price = None;

        let snapshot = engine.normalize(vec![
            raw("a", "P1", 2, 500_000.0),
            elsewhere,
            unpriced,
            raw("b", " p1 ", 2, 510_000.0),
        ]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].price, Some(510_000.0));
        assert_eq!(snapshot[0].source, "b");
    }

    struct StalledFetcher;

    #[async_trait]
    impl ListingFetcher for StalledFetcher {
        async fn fetch(&self, _query: &ListingQuery) -> Result<Vec<RawListing>, FetchError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_fetch_timeout_aborts_cycle() {
        let store = Arc::new(PropertyStore::in_memory().await.unwrap());
        let engine = ChangeEngine::new(
            Arc::new(StalledFetcher),
            store,
            EngineConfig {
                cycle_timeout: Duration::from_millis(50),
                ..config()
            },
        );

        let result = engine.run_cycle().await;

        assert_eq!(result.outcome, CycleOutcome::Aborted);
        assert_eq!(result.consecutive_failures, 1);
        assert!(result.sources.iter().all(|s| !s.succeeded()));
        tokio_test::assert_ok!(engine.store().get_run(&result.run_id).await);
    }

    #[tokio::test]
    async fn test_overlapping_cycles_are_serialized() {
        let mut fetcher = MockListingFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok(vec![raw("a", "P1", 2, 500_000.0)]));
        let engine = Arc::new(engine_with(fetcher).await);

        let (first, second) = tokio::join!(engine.run_cycle(), engine.run_cycle());

        // Whichever ran first created the listing; the other saw no change
        assert_eq!(first.new_listings() + second.new_listings(), 1);
        assert_eq!(engine.store().active_properties().await.unwrap().len(), 1);
    }
}
