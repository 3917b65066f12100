use anyhow::{Context, Result};
use listing_monitor::api::FetchClient;
use listing_monitor::core::{logging, Config, HealthChecker};
use listing_monitor::monitoring::{ChangeEngine, CycleResult, ListingEvent, PropertyStore};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    logging::init_logging(&config.monitoring.log_level);

    config.validate().context("Invalid configuration")?;
    let run_once = std::env::args().any(|arg| arg == "--once");

    tracing::info!("🏠 Listing Monitor starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Target area: {}",
        config.monitoring.target_locations.join(" | ")
    );

    let store = Arc::new(
        PropertyStore::new(&config.database.path)
            .await
            .context("Failed to open property store")?,
    );
    store
        .recover_interrupted_runs()
        .await
        .context("Failed to close interrupted runs")?;

    let fetcher = Arc::new(FetchClient::new(
        config.fetch_client_config(),
        config.listing_sources(),
    )?);
    let engine = Arc::new(ChangeEngine::new(
        fetcher,
        store.clone(),
        config.engine_config(),
    ));

    let health_checker = Arc::new(HealthChecker::new(
        config.monitoring.failure_alert_threshold,
    ));
    health_checker
        .update_component("database", store.ping().await)
        .await;

    if run_once {
        let result = run_and_report(&engine, &health_checker, &config).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    // Start health check endpoint
    let health_clone = health_checker.clone();
    let health_port = config.monitoring.health_port;
    tokio::spawn(async move { start_health_server(health_clone, health_port).await });

    tracing::info!("✅ Health endpoint running on port {}", health_port);

    let mut interval =
        tokio::time::interval(Duration::from_secs(config.monitoring.interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_and_report(&engine, &health_checker, &config).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("👋 Shutdown requested, stopping monitor");
                break;
            }
        }
    }

    Ok(())
}

async fn run_and_report(
    engine: &ChangeEngine,
    health_checker: &HealthChecker,
    config: &Config,
) -> CycleResult {
    let result = engine.run_cycle().await;

    health_checker
        .record_cycle(engine.health().await, engine.store().ping().await)
        .await;

    for event in &result.events {
        let property = event.property();
        match event {
            ListingEvent::NewListing { .. } => tracing::info!(
                "🏠 New: {} | {} | AED {:.0} | {}",
                property.title,
                property.bedroom_count(),
                property.price,
                property.url.as_deref().unwrap_or("-")
            ),
            ListingEvent::PriceChange {
                old_price,
                new_price,
                ..
            } => tracing::info!(
                "💰 Price: {} | AED {:.0} → AED {:.0} ({:+.1}%)",
                property.title,
                old_price,
                new_price,
                (new_price - old_price) / old_price * 100.0
            ),
            ListingEvent::Delisting { .. } => tracing::info!(
                "❌ Delisted: {} | last price AED {:.0}",
                property.title,
                property.price
            ),
        }
    }

    if result.consecutive_failures >= config.monitoring.failure_alert_threshold {
        tracing::error!(
            "🚨 {} consecutive monitoring cycles failed",
            result.consecutive_failures
        );
    }

    match serde_json::to_string(&result) {
        Ok(json) => tracing::debug!("Cycle result: {}", json),
        Err(e) => tracing::warn!("Could not serialize cycle result: {}", e),
    }

    result
}

async fn start_health_server(health_checker: Arc<HealthChecker>, port: u16) {
    use warp::Filter;

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::any().map(move || health_checker.clone()))
        .and_then(|checker: Arc<HealthChecker>| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    warp::serve(health).run(([0, 0, 0, 0], port)).await;
}
