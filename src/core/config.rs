use anyhow::{bail, Result};
use serde::Deserialize;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::api::sources::{APIFY_DATASET, UAE_REAL_ESTATE};
use crate::api::{
    ApifyDatasetSource, FetchClientConfig, ListingQuery, ListingSource, RetryPolicy,
    ThrottleConfig, UaeRealEstateSource,
};
use crate::monitoring::EngineConfig;

const DEFAULT_TARGET_LOCATIONS: &str = "Ras Al Khor Third,Ras Al Khor Industrial Area 3,Ras Al Khor Industrial 3,Ras Al Khor Ind Third";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub monitoring: MonitoringConfig,
    pub fetch: FetchConfig,
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub interval_secs: u64,
    pub cycle_timeout_secs: u64,
    pub failure_alert_threshold: u32,
    pub log_level: String,
    pub health_port: u16,
    pub target_locations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,
    pub rate_limit_delay_ms: u64,
    pub page_size: u32,
    pub max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub uae_api_key: String,
    pub uae_base_url: String,
    pub uae_location_ids: String,
    pub uae_purposes: Vec<String>,
    pub apify_token: String,
    pub apify_base_url: String,
    pub apify_actor: String,
    pub apify_location: String,
}

impl SourcesConfig {
    pub fn uae_enabled(&self) -> bool {
        !self.uae_api_key.trim().is_empty()
    }

    pub fn apify_enabled(&self) -> bool {
        !self.apify_token.trim().is_empty()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Config {
            database: DatabaseConfig {
                path: env::var("DATABASE_PATH")
                    .unwrap_or_else(|_| "data/property_listings.db".to_string()),
            },
            monitoring: MonitoringConfig {
                interval_secs: env::var("MONITORING_INTERVAL_SECS")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .unwrap_or(600),
                cycle_timeout_secs: env::var("CYCLE_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "900".to_string())
                    .parse()
                    .unwrap_or(900),
                failure_alert_threshold: env::var("FAILURE_ALERT_THRESHOLD")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                health_port: env::var("HEALTH_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
                target_locations: split_list(
                    &env::var("TARGET_LOCATIONS")
                        .unwrap_or_else(|_| DEFAULT_TARGET_LOCATIONS.to_string()),
                ),
            },
            fetch: FetchConfig {
                request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
                max_retries: env::var("MAX_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                retry_base_delay_ms: env::var("RETRY_BASE_DELAY_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
                retry_max_delay_ms: env::var("RETRY_MAX_DELAY_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30000),
                retry_jitter: env::var("RETRY_JITTER")
                    .unwrap_or_else(|_| "0.2".to_string())
                    .parse()
                    .unwrap_or(0.2),
                rate_limit_delay_ms: env::var("API_RATE_LIMIT_DELAY_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
                page_size: env::var("PAGE_SIZE")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
                max_pages: env::var("MAX_PAGES")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            sources: SourcesConfig {
                uae_api_key: env::var("UAE_REAL_ESTATE_API_KEY").unwrap_or_default(),
                uae_base_url: env::var("UAE_REAL_ESTATE_BASE_URL")
                    .unwrap_or_else(|_| "https://uae-real-estate.p.rapidapi.com".to_string()),
                uae_location_ids: env::var("UAE_LOCATION_EXTERNAL_IDS")
                    .unwrap_or_else(|_| "5003".to_string()),
                uae_purposes: split_list(
                    &env::var("UAE_PURPOSES").unwrap_or_else(|_| "for-rent,for-sale".to_string()),
                ),
                apify_token: env::var("APIFY_API_TOKEN").unwrap_or_default(),
                apify_base_url: env::var("APIFY_BASE_URL")
                    .unwrap_or_else(|_| "https://api.apify.com/v2".to_string()),
                apify_actor: env::var("APIFY_ACTOR")
                    .unwrap_or_else(|_| "dhrumil~propertyfinder-scraper".to_string()),
                apify_location: env::var("APIFY_LOCATION")
                    .unwrap_or_else(|_| "ras-al-khor".to_string()),
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring.interval_secs == 0 {
            bail!("MONITORING_INTERVAL_SECS must be greater than zero");
        }
        if self.monitoring.cycle_timeout_secs == 0 {
            bail!("CYCLE_TIMEOUT_SECS must be greater than zero");
        }
        if self.fetch.page_size == 0 || self.fetch.max_pages == 0 {
            bail!("PAGE_SIZE and MAX_PAGES must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.fetch.retry_jitter) {
            bail!("RETRY_JITTER must be between 0 and 1");
        }
        if !self.sources.uae_enabled() && !self.sources.apify_enabled() {
            bail!("no listing source enabled: set UAE_REAL_ESTATE_API_KEY or APIFY_API_TOKEN");
        }
        Ok(())
    }

    pub fn fetch_client_config(&self) -> FetchClientConfig {
        FetchClientConfig {
            request_timeout: Duration::from_secs(self.fetch.request_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.fetch.max_retries,
                base_delay: Duration::from_millis(self.fetch.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.fetch.retry_max_delay_ms),
                jitter_ratio: self.fetch.retry_jitter,
            },
            throttle: ThrottleConfig {
                min_interval: Duration::from_millis(self.fetch.rate_limit_delay_ms),
            },
        }
    }

    /// Source adapters for every source with credentials.
    pub fn listing_sources(&self) -> Vec<Arc<dyn ListingSource>> {
        let mut sources: Vec<Arc<dyn ListingSource>> = Vec::new();

        if self.sources.uae_enabled() {
            sources.push(Arc::new(UaeRealEstateSource::new(
                &self.sources.uae_base_url,
                &self.sources.uae_api_key,
            )));
        }
        if self.sources.apify_enabled() {
            sources.push(Arc::new(ApifyDatasetSource::new(
                &self.sources.apify_base_url,
                &self.sources.apify_token,
                &self.sources.apify_actor,
            )));
        }

        sources
    }

    /// One query per enabled source and purpose.
    pub fn queries(&self) -> Vec<ListingQuery> {
        let mut queries = Vec::new();

        if self.sources.uae_enabled() {
            if self.sources.uae_purposes.is_empty() {
                queries.push(
                    ListingQuery::new(UAE_REAL_ESTATE, &self.sources.uae_location_ids)
                        .with_paging(self.fetch.page_size, self.fetch.max_pages),
                );
            }
            for purpose in &self.sources.uae_purposes {
                queries.push(
                    ListingQuery::new(UAE_REAL_ESTATE, &self.sources.uae_location_ids)
                        .with_purpose(purpose)
                        .with_paging(self.fetch.page_size, self.fetch.max_pages),
                );
            }
        }

        if self.sources.apify_enabled() {
            queries.push(
                ListingQuery::new(APIFY_DATASET, &self.sources.apify_location)
                    .with_paging(self.fetch.page_size, 1),
            );
        }

        queries
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queries: self.queries(),
            target_locations: self.monitoring.target_locations.clone(),
            cycle_timeout: Duration::from_secs(self.monitoring.cycle_timeout_secs),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
