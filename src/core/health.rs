use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::monitoring::{CycleOutcome, HealthState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: ComponentHealth,
    pub consecutive_failures: u32,
    pub last_outcome: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_cycles: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub database: bool,
    pub sources: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, bool>,
}

impl ComponentHealth {
    pub fn get(&self, key: &str) -> Option<bool> {
        match key {
            "database" => Some(self.database),
            "sources" => Some(self.sources),
            _ => self.extra.get(key).copied(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MonitorSnapshot {
    components: ComponentHealth,
    state: HealthState,
}

/// Health reported at `/health`: `failing` once consecutive failed cycles
/// reach the alert threshold, `degraded` when the last cycle did not fully
/// complete, `healthy` otherwise.
#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    failure_threshold: u32,
    snapshot: Arc<RwLock<MonitorSnapshot>>,
}

impl HealthChecker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            failure_threshold,
            snapshot: Arc::new(RwLock::new(MonitorSnapshot::default())),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let MonitorSnapshot { components, state } = self.snapshot.read().await.clone();

        HealthStatus {
            status: classify(&state, &components, self.failure_threshold).to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components,
            consecutive_failures: state.consecutive_failures,
            last_outcome: state.last_outcome.as_ref().map(|o| o.label().to_string()),
            last_success_at: state.last_success_at,
            total_cycles: state.total_cycles,
        }
    }

    /// Take the engine's counters after a cycle.
    pub async fn record_cycle(&self, state: HealthState, database_reachable: bool) {
        let mut snapshot = self.snapshot.write().await;
        snapshot.components.database = database_reachable;
        snapshot.components.sources = state.consecutive_failures == 0
            && !matches!(state.last_outcome, Some(CycleOutcome::Aborted));
        snapshot.state = state;
    }

    pub async fn update_component(&self, component: &str, healthy: bool) {
        let mut snapshot = self.snapshot.write().await;
        let components = &mut snapshot.components;
        match component {
            "database" => components.database = healthy,
            "sources" => components.sources = healthy,
            _ => {
                components.extra.insert(component.to_string(), healthy);
            }
        }
    }
}

fn classify(state: &HealthState, components: &ComponentHealth, threshold: u32) -> &'static str {
    if state.consecutive_failures >= threshold.max(1) {
        return "failing";
    }
    match &state.last_outcome {
        Some(CycleOutcome::Completed) if components.database => "healthy",
        // Before the first cycle there is nothing to judge yet
        None if components.database => "healthy",
        _ => "degraded",
    }
}
