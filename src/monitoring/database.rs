use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::normalize::{dedup_last_wins, prices_differ, to_candidate, PropertyCandidate};
use super::types::{
    ActivitySummary, BedroomCount, ListingEvent, MonitoringRun, PriceChangeRecord,
    PriceHistoryEntry, Property, PropertyStatus, ReconcileResult, RunOutcome, RunTally,
    StoreStatistics,
};
use crate::api::RawListing;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    WriteFailed(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_) => StoreError::Corrupt(e.to_string()),
            _ => StoreError::WriteFailed(e.to_string()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct PropertyRow {
    id: String,
    external_id: String,
    source: String,
    title: String,
    location_label: String,
    property_type: String,
    listing_type: String,
    price: f64,
    bedrooms: i64,
    bathrooms: Option<i64>,
    size_sqft: Option<f64>,
    url: Option<String>,
    status: String,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    delisted_at: Option<DateTime<Utc>>,
}

impl TryFrom<PropertyRow> for Property {
    type Error = StoreError;

    fn try_from(row: PropertyRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<PropertyStatus>()
            .map_err(|e| StoreError::Corrupt(format!("property {}: {}", row.id, e)))?;
        let bedrooms = u32::try_from(row.bedrooms)
            .map_err(|_| StoreError::Corrupt(format!("property {}: bedrooms {}", row.id, row.bedrooms)))?;

        Ok(Property {
            id: row.id,
            external_id: row.external_id,
            source: row.source,
            title: row.title,
            location_label: row.location_label,
            property_type: row.property_type,
            listing_type: row.listing_type,
            price: row.price,
            bedrooms,
            bathrooms: row.bathrooms.and_then(|b| u32::try_from(b).ok()),
            size_sqft: row.size_sqft,
            url: row.url,
            status,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            delisted_at: row.delisted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<String>,
    new_count: i64,
    changed_count: i64,
    removed_count: i64,
    listings_seen: i64,
    sources_ok: i64,
    sources_failed: i64,
    error_detail: Option<String>,
}

impl TryFrom<RunRow> for MonitoringRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let outcome = row
            .outcome
            .as_deref()
            .map(RunOutcome::from_str)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("run {}: {}", row.run_id, e)))?;

        Ok(MonitoringRun {
            run_id: row.run_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            outcome,
            new_count: row.new_count as u32,
            changed_count: row.changed_count as u32,
            removed_count: row.removed_count as u32,
            listings_seen: row.listings_seen as u32,
            sources_ok: row.sources_ok as u32,
            sources_failed: row.sources_failed as u32,
            error_detail: row.error_detail,
        })
    }
}

/// Durable state of the monitored area: properties, their price history
/// and the run log. The only writer of all three tables.
pub struct PropertyStore {
    pool: SqlitePool,
}

impl PropertyStore {
    pub async fn new(database_path: &str) -> Result<Self, StoreError> {
        let file_path = database_path.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
        if let Some(parent) = Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::WriteFailed(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", file_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;

        info!("✅ Property store opened at {}", file_path);
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS properties (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL,
                source TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                location_label TEXT NOT NULL,
                property_type TEXT NOT NULL DEFAULT '',
                listing_type TEXT NOT NULL DEFAULT '',
                price REAL NOT NULL,
                bedrooms INTEGER NOT NULL,
                bathrooms INTEGER,
                size_sqft REAL,
                url TEXT,
                status TEXT NOT NULL CHECK (status IN ('active', 'inactive')),
                first_seen_at DATETIME NOT NULL,
                last_seen_at DATETIME NOT NULL,
                delisted_at DATETIME
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_history (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                property_id TEXT NOT NULL,
                price REAL NOT NULL,
                observed_at DATETIME NOT NULL,
                FOREIGN KEY (property_id) REFERENCES properties(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_runs (
                run_id TEXT PRIMARY KEY,
                started_at DATETIME NOT NULL,
                finished_at DATETIME,
                outcome TEXT CHECK (outcome IN ('success', 'partial', 'failure')),
                new_count INTEGER NOT NULL DEFAULT 0,
                changed_count INTEGER NOT NULL DEFAULT 0,
                removed_count INTEGER NOT NULL DEFAULT 0,
                listings_seen INTEGER NOT NULL DEFAULT 0,
                sources_ok INTEGER NOT NULL DEFAULT 0,
                sources_failed INTEGER NOT NULL DEFAULT 0,
                error_detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Rows are retired by status, never removed; history and finished runs are frozen
        for statement in [
            r#"
            CREATE TRIGGER IF NOT EXISTS properties_no_delete
            BEFORE DELETE ON properties
            BEGIN SELECT RAISE(ABORT, 'properties are never deleted'); END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS price_history_no_update
            BEFORE UPDATE ON price_history
            BEGIN SELECT RAISE(ABORT, 'price history is append-only'); END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS price_history_no_delete
            BEFORE DELETE ON price_history
            BEGIN SELECT RAISE(ABORT, 'price history is append-only'); END
            "#,
            r#"
            CREATE TRIGGER IF NOT EXISTS monitoring_runs_frozen
            BEFORE UPDATE ON monitoring_runs
            WHEN OLD.finished_at IS NOT NULL
            BEGIN SELECT RAISE(ABORT, 'finished runs are immutable'); END
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_properties_status
            ON properties(status, bedrooms)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_price_history_property
            ON price_history(property_id, entry_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_monitoring_runs_started
            ON monitoring_runs(started_at DESC)
            "#,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Property store schema initialized");
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Run log
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Open a run row. It stays open until `reconcile` or `finish_run_failed`.
    pub async fn begin_run(&self, started_at: DateTime<Utc>) -> Result<String, StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO monitoring_runs (run_id, started_at) VALUES (?, ?)")
            .bind(&run_id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;

        Ok(run_id)
    }

    /// Close a run as `failure`. No property row is touched.
    pub async fn finish_run_failed(
        &self,
        run_id: &str,
        tally: &RunTally,
        detail: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE monitoring_runs SET
                finished_at = ?,
                outcome = 'failure',
                listings_seen = ?,
                sources_ok = ?,
                sources_failed = ?,
                error_detail = ?
            WHERE run_id = ? AND finished_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(tally.listings_seen as i64)
        .bind(tally.sources_ok as i64)
        .bind(tally.sources_failed as i64)
        .bind(detail)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WriteFailed(format!("run {} is not open", run_id)));
        }
        Ok(())
    }

    /// Close runs left open by a crash. Returns how many were closed.
    pub async fn recover_interrupted_runs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE monitoring_runs SET
                finished_at = ?,
                outcome = 'failure',
                error_detail = 'interrupted before completion'
            WHERE finished_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!("⚠️  Closed {} interrupted monitoring runs", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<MonitoringRun>, StoreError> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM monitoring_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .map(MonitoringRun::try_from)
            .transpose()
    }

    pub async fn last_run(&self) -> Result<Option<MonitoringRun>, StoreError> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM monitoring_runs
            WHERE finished_at IS NOT NULL
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .map(MonitoringRun::try_from)
        .transpose()
    }

    /// Latest run that reconciled a snapshot; the "since last run" anchor.
    pub async fn last_successful_run(&self) -> Result<Option<MonitoringRun>, StoreError> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM monitoring_runs
            WHERE outcome IN ('success', 'partial')
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .map(MonitoringRun::try_from)
        .transpose()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Reconciliation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Diff a snapshot against stored state and commit it, together with the
    /// run row, in one transaction.
    ///
    /// Unknown ids become new listings, known ids are refreshed (price
    /// changes appended to history, inactive ids relisted), and active ids
    /// missing from the snapshot are delisted. An empty snapshot delists
    /// everything, so callers must not pass the result of a failed fetch.
    pub async fn reconcile(
        &self,
        run_id: &str,
        snapshot: &[RawListing],
        tally: &RunTally,
    ) -> Result<ReconcileResult, StoreError> {
        let mut skipped_count = 0u32;
        let candidates: Vec<PropertyCandidate> = snapshot
            .iter()
            .filter_map(|raw| match to_candidate(raw) {
                Ok(candidate) => Some(candidate),
                Err(issues) => {
                    skipped_count += 1;
                    warn!(
                        "⚠️  Skipping listing {} from {}: {}",
                        raw.external_id,
                        raw.source,
                        issues.join(", ")
                    );
                    None
                }
            })
            .collect();
        let candidates = dedup_last_wins(candidates, |c| c.id.clone());

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let known: HashMap<String, Property> =
            sqlx::query_as::<_, PropertyRow>("SELECT * FROM properties")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .map(|row| Property::try_from(row).map(|p| (p.id.clone(), p)))
                .collect::<Result<_, _>>()?;

        let mut result = ReconcileResult {
            skipped_count,
            ..Default::default()
        };
        let mut seen: HashSet<&str> = HashSet::with_capacity(candidates.len());

        for candidate in &candidates {
            seen.insert(candidate.id.as_str());

            let Some(existing) = known.get(&candidate.id) else {
                insert_property(&mut tx, candidate, now).await?;
                append_price(&mut tx, &candidate.id, candidate.price, now).await?;

                info!(
                    "🆕 NEW LISTING: {} ({} BR, {}) at {:.0}",
                    candidate.title, candidate.bedrooms, candidate.location_label, candidate.price
                );
                result.new_count += 1;
                result.events.push(ListingEvent::NewListing {
                    property: to_property(candidate, now, now),
                });
                continue;
            };

            let relisted = !existing.is_active();
            let price_changed = prices_differ(existing.price, candidate.price);

            refresh_property(&mut tx, candidate, now).await?;

            if price_changed {
                append_price(&mut tx, &candidate.id, candidate.price, now).await?;

                info!(
                    "💰 PRICE CHANGE: {} {:.0} → {:.0}",
                    candidate.title, existing.price, candidate.price
                );
                result.changed_count += 1;
                result.events.push(ListingEvent::PriceChange {
                    property: to_property(candidate, existing.first_seen_at, now),
                    old_price: existing.price,
                    new_price: candidate.price,
                });
            }

            if relisted {
                info!("🔁 RELISTED: {} ({})", candidate.title, candidate.id);
                result.relisted_count += 1;
            } else if !price_changed {
                result.unchanged_count += 1;
            }
        }

        let mut delisted: Vec<&Property> = known
            .values()
            .filter(|p| p.is_active() && !seen.contains(p.id.as_str()))
            .collect();
        delisted.sort_by(|a, b| a.id.cmp(&b.id));

        for property in delisted {
            sqlx::query(
                r#"
                UPDATE properties SET status = 'inactive', delisted_at = ?
                WHERE id = ?
                "#,
            )
            .bind(now)
            .bind(&property.id)
            .execute(&mut *tx)
            .await?;

            info!("❌ DELISTED: {} ({})", property.title, property.id);
            result.removed_count += 1;
            result.events.push(ListingEvent::Delisting {
                property: Property {
                    status: PropertyStatus::Inactive,
                    delisted_at: Some(now),
                    ..property.clone()
                },
            });
        }

        let finalized = sqlx::query(
            r#"
            UPDATE monitoring_runs SET
                finished_at = ?,
                outcome = ?,
                new_count = ?,
                changed_count = ?,
                removed_count = ?,
                listings_seen = ?,
                sources_ok = ?,
                sources_failed = ?,
                error_detail = ?
            WHERE run_id = ? AND finished_at IS NULL
            "#,
        )
        .bind(now)
        .bind(tally.outcome().as_str())
        .bind(result.new_count as i64)
        .bind(result.changed_count as i64)
        .bind(result.removed_count as i64)
        .bind(tally.listings_seen as i64)
        .bind(tally.sources_ok as i64)
        .bind(tally.sources_failed as i64)
        .bind(&tally.error_detail)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        if finalized.rows_affected() == 0 {
            // Dropping the transaction rolls back every property change above
            return Err(StoreError::WriteFailed(format!("run {} is not open", run_id)));
        }

        tx.commit().await?;

        info!(
            "✅ Reconciled {} candidates: {} new, {} price changes, {} delisted, {} relisted",
            candidates.len(),
            result.new_count,
            result.changed_count,
            result.removed_count,
            result.relisted_count
        );

        Ok(result)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Reads
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Active listings per bedroom bucket. Buckets seen before but with no
    /// active listing report 0.
    pub async fn current_listing_counts(&self) -> Result<BTreeMap<BedroomCount, usize>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT bedrooms, SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END)
            FROM properties
            GROUP BY bedrooms
            ORDER BY bedrooms
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(bedrooms, active)| {
                let bedrooms = u32::try_from(bedrooms)
                    .map_err(|_| StoreError::Corrupt(format!("bedrooms {}", bedrooms)))?;
                Ok((BedroomCount(bedrooms), active as usize))
            })
            .collect()
    }

    pub async fn get_property(&self, id: &str) -> Result<Option<Property>, StoreError> {
        sqlx::query_as::<_, PropertyRow>("SELECT * FROM properties WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Property::try_from)
            .transpose()
    }

    pub async fn active_properties(&self) -> Result<Vec<Property>, StoreError> {
        sqlx::query_as::<_, PropertyRow>(
            "SELECT * FROM properties WHERE status = 'active' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Property::try_from)
        .collect()
    }

    pub async fn price_history(&self, property_id: &str) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, f64, DateTime<Utc>)>(
            r#"
            SELECT entry_id, property_id, price, observed_at
            FROM price_history
            WHERE property_id = ?
            ORDER BY entry_id
            "#,
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(entry_id, property_id, price, observed_at)| PriceHistoryEntry {
                entry_id,
                property_id,
                price,
                observed_at,
            })
            .collect())
    }

    /// New listings, price changes and delistings recorded at or after `since`.
    pub async fn history_since(&self, since: DateTime<Utc>) -> Result<ActivitySummary, StoreError> {
        let new = sqlx::query_as::<_, PropertyRow>(
            "SELECT * FROM properties WHERE first_seen_at >= ? ORDER BY first_seen_at, id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Property::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        let delisted = sqlx::query_as::<_, PropertyRow>(
            r#"
            SELECT * FROM properties
            WHERE status = 'inactive' AND delisted_at >= ?
            ORDER BY delisted_at, id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Property::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        // The first history entry of a property is its opening price, not a change
        let rows = sqlx::query_as::<_, (String, String, Option<f64>, f64, DateTime<Utc>)>(
            r#"
            SELECT ph.property_id, p.title,
                (SELECT prev.price FROM price_history prev
                 WHERE prev.property_id = ph.property_id AND prev.entry_id < ph.entry_id
                 ORDER BY prev.entry_id DESC LIMIT 1),
                ph.price, ph.observed_at
            FROM price_history ph
            JOIN properties p ON p.id = ph.property_id
            WHERE ph.observed_at >= ?
            ORDER BY ph.entry_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let price_changes = rows
            .into_iter()
            .filter_map(|(property_id, title, old_price, new_price, observed_at)| {
                old_price.map(|old_price| PriceChangeRecord {
                    property_id,
                    title,
                    old_price,
                    new_price,
                    observed_at,
                })
            })
            .collect();

        Ok(ActivitySummary {
            new,
            price_changes,
            delisted,
        })
    }

    pub async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let (total, active) = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0)
            FROM properties
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let last_check = self.last_run().await?.and_then(|run| run.finished_at);
        let recent = self.history_since(Utc::now() - Duration::hours(24)).await?;

        Ok(StoreStatistics {
            total_properties: total as usize,
            active_properties: active as usize,
            inactive_properties: (total - active) as usize,
            last_check,
            new_last_24h: recent.new.len(),
            price_changes_last_24h: recent.price_changes.len(),
            delisted_last_24h: recent.delisted.len(),
        })
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

async fn insert_property(
    conn: &mut SqliteConnection,
    candidate: &PropertyCandidate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO properties (
            id, external_id, source, title, location_label, property_type,
            listing_type, price, bedrooms, bathrooms, size_sqft, url,
            status, first_seen_at, last_seen_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
        "#,
    )
    .bind(&candidate.id)
    .bind(&candidate.external_id)
    .bind(&candidate.source)
    .bind(&candidate.title)
    .bind(&candidate.location_label)
    .bind(&candidate.property_type)
    .bind(&candidate.listing_type)
    .bind(candidate.price)
    .bind(candidate.bedrooms as i64)
    .bind(candidate.bathrooms.map(i64::from))
    .bind(candidate.size_sqft)
    .bind(&candidate.url)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Refresh a known row from the snapshot; also reactivates a delisted one.
async fn refresh_property(
    conn: &mut SqliteConnection,
    candidate: &PropertyCandidate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE properties SET
            external_id = ?,
            source = ?,
            title = ?,
            property_type = ?,
            listing_type = ?,
            price = ?,
            bathrooms = ?,
            url = ?,
            status = 'active',
            last_seen_at = ?,
            delisted_at = NULL
        WHERE id = ?
        "#,
    )
    .bind(&candidate.external_id)
    .bind(&candidate.source)
    .bind(&candidate.title)
    .bind(&candidate.property_type)
    .bind(&candidate.listing_type)
    .bind(candidate.price)
    .bind(candidate.bathrooms.map(i64::from))
    .bind(&candidate.url)
    .bind(now)
    .bind(&candidate.id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn append_price(
    conn: &mut SqliteConnection,
    property_id: &str,
    price: f64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO price_history (property_id, price, observed_at) VALUES (?, ?, ?)")
        .bind(property_id)
        .bind(price)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

fn to_property(
    candidate: &PropertyCandidate,
    first_seen_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Property {
    Property {
        id: candidate.id.clone(),
        external_id: candidate.external_id.clone(),
        source: candidate.source.clone(),
        title: candidate.title.clone(),
        location_label: candidate.location_label.clone(),
        property_type: candidate.property_type.clone(),
        listing_type: candidate.listing_type.clone(),
        price: candidate.price,
        bedrooms: candidate.bedrooms,
        bathrooms: candidate.bathrooms,
        size_sqft: candidate.size_sqft,
        url: candidate.url.clone(),
        status: PropertyStatus::Active,
        first_seen_at,
        last_seen_at: now,
        delisted_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::normalize::property_id;

    fn listing(external_id: &str, bedrooms: u32, price: f64) -> RawListing {
        RawListing {
            source: "uae_real_estate".to_string(),
            external_id: external_id.to_string(),
            title: format!("Listing {}", external_id),
            location: "Ras Al Khor Industrial Area 3".to_string(),
            property_type: "apartment".to_string(),
            listing_type: "rent".to_string(),
            price: Some(price),
            bedrooms: Some(bedrooms),
            bathrooms: Some(2),
            size_sqft: Some(1000.0),
            url: None,
        }
    }

    fn id_of(external_id: &str, bedrooms: u32) -> String {
        property_id(external_id, "Ras Al Khor Industrial Area 3", bedrooms, Some(1000.0))
    }

    fn ok_tally(listings: usize) -> RunTally {
        RunTally {
            listings_seen: listings as u32,
            sources_ok: 1,
            sources_failed: 0,
            error_detail: None,
        }
    }

    async fn reconcile(store: &PropertyStore, snapshot: &[RawListing]) -> ReconcileResult {
        let run_id = store.begin_run(Utc::now()).await.unwrap();
        store
            .reconcile(&run_id, snapshot, &ok_tally(snapshot.len()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_snapshot_inserts_everything_as_new() {
        let store = PropertyStore::in_memory().await.unwrap();
        let result = reconcile(&store, &[listing("P1", 2, 500_000.0), listing("P2", 3, 700_000.0)]).await;

        assert_eq!(result.new_count, 2);
        assert_eq!(result.events.len(), 2);
        assert!(result
            .events
            .iter()
            .all(|e| matches!(e, ListingEvent::NewListing { .. })));

        let p1 = store.get_property(&id_of("P1", 2)).await.unwrap().unwrap();
        assert!(p1.is_active());
        assert_eq!(p1.price, 500_000.0);
        assert_eq!(store.price_history(&p1.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = PropertyStore::in_memory().await.unwrap();
        let snapshot = vec![listing("P1", 2, 500_000.0), listing("P2", 3, 700_000.0)];

        reconcile(&store, &snapshot).await;
        let before = store.active_properties().await.unwrap();
        let second = reconcile(&store, &snapshot).await;

        assert!(second.events.is_empty());
        assert_eq!(second.unchanged_count, 2);
        let after = store.active_properties().await.unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.price, a.price);
            assert_eq!(b.first_seen_at, a.first_seen_at);
        }
        assert_eq!(store.price_history(&id_of("P1", 2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_price_change_delisting_and_counts() {
        let store = PropertyStore::in_memory().await.unwrap();
        reconcile(&store, &[listing("P1", 2, 500_000.0), listing("P2", 3, 700_000.0)]).await;

        let result = reconcile(&store, &[listing("P1", 2, 520_000.0), listing("P3", 2, 650_000.0)]).await;

        assert_eq!(result.events.len(), 3);
        match &result.events[0] {
            ListingEvent::PriceChange {
                property,
                old_price,
                new_price,
            } => {
                assert_eq!(property.id, id_of("P1", 2));
                assert_eq!(*old_price, 500_000.0);
                assert_eq!(*new_price, 520_000.0);
            }
            other => panic!("expected price change, got {:?}", other),
        }
        assert!(matches!(&result.events[1], ListingEvent::NewListing { property } if property.id == id_of("P3", 2)));
        assert!(matches!(&result.events[2], ListingEvent::Delisting { property } if property.id == id_of("P2", 3)));

        let counts = store.current_listing_counts().await.unwrap();
        assert_eq!(counts.get(&BedroomCount(2)), Some(&2));
        assert_eq!(counts.get(&BedroomCount(3)), Some(&0));

        let p2 = store.get_property(&id_of("P2", 3)).await.unwrap().unwrap();
        assert_eq!(p2.status, PropertyStatus::Inactive);
        assert!(p2.delisted_at.is_some());

        let history = store.price_history(&id_of("P1", 2)).await.unwrap();
        let prices: Vec<f64> = history.iter().map(|h| h.price).collect();
        assert_eq!(prices, vec![500_000.0, 520_000.0]);
    }

    #[tokio::test]
    async fn test_empty_snapshot_delists_all_active() {
        let store = PropertyStore::in_memory().await.unwrap();
        reconcile(
            &store,
            &[listing("A", 1, 1.0e5), listing("B", 2, 2.0e5), listing("C", 3, 3.0e5)],
        )
        .await;

        let result = reconcile(&store, &[]).await;

        assert_eq!(result.removed_count, 3);
        assert_eq!(result.new_count, 0);
        assert_eq!(result.changed_count, 0);
        assert!(result
            .events
            .iter()
            .all(|e| matches!(e, ListingEvent::Delisting { .. })));
        assert!(store.active_properties().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_snapshot_last_write_wins() {
        let store = PropertyStore::in_memory().await.unwrap();
        let result = reconcile(&store, &[listing("P1", 2, 500_000.0), listing("P1", 2, 510_000.0)]).await;

        assert_eq!(result.new_count, 1);
        let stored = store.get_property(&id_of("P1", 2)).await.unwrap().unwrap();
        assert_eq!(stored.price, 510_000.0);
        assert_eq!(store.active_properties().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relisting_reactivates_without_new_listing() {
        let store = PropertyStore::in_memory().await.unwrap();
        reconcile(&store, &[listing("P1", 2, 500_000.0)]).await;
        reconcile(&store, &[]).await;

        let result = reconcile(&store, &[listing("P1", 2, 480_000.0)]).await;

        assert_eq!(result.new_count, 0);
        assert_eq!(result.relisted_count, 1);
        assert_eq!(result.events.len(), 1);
        assert!(matches!(
            &result.events[0],
            ListingEvent::PriceChange { old_price, new_price, .. } if *old_price == 500_000.0 && *new_price == 480_000.0
        ));

        let stored = store.get_property(&id_of("P1", 2)).await.unwrap().unwrap();
        assert!(stored.is_active());
        assert!(stored.delisted_at.is_none());
    }

    #[tokio::test]
    async fn test_relisting_at_same_price_emits_nothing() {
        let store = PropertyStore::in_memory().await.unwrap();
        reconcile(&store, &[listing("P1", 2, 500_000.0)]).await;
        reconcile(&store, &[]).await;

        let result = reconcile(&store, &[listing("P1", 2, 500_000.0)]).await;

        assert!(result.events.is_empty());
        assert_eq!(result.relisted_count, 1);
        assert!(store.get_property(&id_of("P1", 2)).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_failed_finalization_rolls_back_everything() {
        let store = PropertyStore::in_memory().await.unwrap();
        reconcile(&store, &[listing("P1", 2, 500_000.0), listing("P2", 3, 700_000.0)]).await;
        let before = store.active_properties().await.unwrap();

        let err = store
            .reconcile(
                "no-such-run",
                &[listing("P1", 2, 999_000.0), listing("P9", 1, 100_000.0)],
                &ok_tally(2),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::WriteFailed(_)));
        assert_eq!(store.active_properties().await.unwrap(), before);
        assert!(store.get_property(&id_of("P9", 1)).await.unwrap().is_none());
        assert_eq!(store.price_history(&id_of("P1", 2)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_records_are_skipped() {
        let store = PropertyStore::in_memory().await.unwrap();
        let mut no_price = listing("P2", 2, 0.0);
        no_price.price = None;

        let result = reconcile(&store, &[listing("P1", 2, 500_000.0), no_price]).await;

        assert_eq!(result.new_count, 1);
        assert_eq!(result.skipped_count, 1);
    }

    #[tokio::test]
    async fn test_run_row_is_finalized_once() {
        let store = PropertyStore::in_memory().await.unwrap();
        let run_id = store.begin_run(Utc::now()).await.unwrap();

        let open = store.get_run(&run_id).await.unwrap().unwrap();
        assert!(open.outcome.is_none());
        assert!(open.finished_at.is_none());

        store
            .reconcile(&run_id, &[listing("P1", 2, 500_000.0)], &ok_tally(1))
            .await
            .unwrap();

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Success));
        assert_eq!(run.new_count, 1);
        assert!(run.finished_at.is_some());

        let again = store.finish_run_failed(&run_id, &RunTally::default(), "late").await;
        assert!(again.is_err());
        assert_eq!(store.get_run(&run_id).await.unwrap().unwrap().outcome, Some(RunOutcome::Success));
    }

    #[tokio::test]
    async fn test_partial_tally_marks_run_partial() {
        let store = PropertyStore::in_memory().await.unwrap();
        let run_id = store.begin_run(Utc::now()).await.unwrap();
        let tally = RunTally {
            listings_seen: 1,
            sources_ok: 1,
            sources_failed: 1,
            error_detail: Some("apify_dataset: HTTP 503".to_string()),
        };

        store
            .reconcile(&run_id, &[listing("P1", 2, 500_000.0)], &tally)
            .await
            .unwrap();

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Partial));
        assert_eq!(run.error_detail.as_deref(), Some("apify_dataset: HTTP 503"));
        assert_eq!(store.last_successful_run().await.unwrap().unwrap().run_id, run_id);
    }

    #[tokio::test]
    async fn test_recover_interrupted_runs() {
        let store = PropertyStore::in_memory().await.unwrap();
        let run_id = store.begin_run(Utc::now()).await.unwrap();

        assert_eq!(store.recover_interrupted_runs().await.unwrap(), 1);
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failure));
        assert_eq!(store.recover_interrupted_runs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_history_since_reports_recent_activity() {
        let store = PropertyStore::in_memory().await.unwrap();
        let since = Utc::now() - Duration::seconds(1);

        reconcile(&store, &[listing("P1", 2, 500_000.0), listing("P2", 3, 700_000.0)]).await;
        reconcile(&store, &[listing("P1", 2, 520_000.0)]).await;

        let activity = store.history_since(since).await.unwrap();
        assert_eq!(activity.new.len(), 2);
        assert_eq!(activity.price_changes.len(), 1);
        assert_eq!(activity.price_changes[0].old_price, 500_000.0);
        assert_eq!(activity.price_changes[0].new_price, 520_000.0);
        assert_eq!(activity.delisted.len(), 1);

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_properties, 2);
        assert_eq!(stats.active_properties, 1);
        assert_eq!(stats.inactive_properties, 1);
        assert_eq!(stats.price_changes_last_24h, 1);
        assert!(stats.last_check.is_some());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("listing-monitor-{}", uuid::Uuid::new_v4()));
        let path = dir.join("listings.db");
        let path = path.to_str().unwrap();

        {
            let store = PropertyStore::new(path).await.unwrap();
            reconcile(&store, &[listing("P1", 2, 500_000.0)]).await;
        }

        let reopened = PropertyStore::new(path).await.unwrap();
        assert_eq!(reopened.active_properties().await.unwrap().len(), 1);
        assert!(reopened.ping().await);

        let _ = std::fs::remove_dir_all(dir);
    }
}
