use reqwest::{Client, RequestBuilder};
use serde_json::Value;

use super::types::{FetchError, ListingQuery, ParsedPage, RawListing};
use crate::monitoring::normalize::parse_price_text;

pub const UAE_REAL_ESTATE: &str = "uae_real_estate";
pub const APIFY_DATASET: &str = "apify_dataset";

/// A listing API: how to ask it for one page and how to read the answer.
///
/// Transport, throttling and retries are owned by
/// [`FetchClient`](super::client::FetchClient); implementations stay pure.
pub trait ListingSource: Send + Sync {
    fn id(&self) -> &str;

    fn build_request(&self, http: &Client, query: &ListingQuery, page: u32) -> RequestBuilder;

    fn parse_page(&self, body: Value) -> Result<ParsedPage, FetchError>;

    fn max_pages(&self, query: &ListingQuery) -> u32 {
        query.max_pages
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UAE Real Estate (RapidAPI)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UaeRealEstateSource {
    base_url: String,
    api_key: String,
    host: String,
}

impl UaeRealEstateSource {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let host = base_url
            .split("://")
            .nth(1)
            .unwrap_or(base_url.as_str())
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            base_url,
            api_key: api_key.to_string(),
            host,
        }
    }

    fn map_hit(&self, hit: &Value) -> Option<RawListing> {
        let external_id = value_to_string(hit.get("externalID")?)?;

        let location = match hit.get("geography") {
            Some(geography) => ["level1", "level2", "level3", "level4"]
                .iter()
                .filter_map(|level| geography.get(level).and_then(Value::as_str))
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            None => hit
                .get("location")
                .and_then(Value::as_array)
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|level| level.get("name").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default(),
        };

        let property_type = hit
            .get("category")
            .and_then(Value::as_array)
            .and_then(|categories| categories.first())
            .and_then(|category| category.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        Some(RawListing {
            source: UAE_REAL_ESTATE.to_string(),
            url: Some(format!(
                "https://www.bayut.com/property/details-{}",
                external_id
            )),
            external_id,
            title: string_field(hit, &["title"]),
            location,
            property_type,
            listing_type: purpose_label(&string_field(hit, &["purpose"])),
            price: hit.get("price").and_then(value_to_f64),
            bedrooms: hit.get("rooms").and_then(value_to_u32),
            bathrooms: hit.get("baths").and_then(value_to_u32),
            size_sqft: hit.get("area").and_then(value_to_f64),
        })
    }
}

impl ListingSource for UaeRealEstateSource {
    fn id(&self) -> &str {
        UAE_REAL_ESTATE
    }

    fn build_request(&self, http: &Client, query: &ListingQuery, page: u32) -> RequestBuilder {
        let mut params = vec![
            ("locationExternalIDs", query.area_filter.clone()),
            ("hitsPerPage", query.page_size.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(purpose) = &query.purpose {
            params.push(("purpose", purpose.clone()));
        }

        http.get(format!("{}/properties/list", self.base_url))
            .header("x-rapidapi-key", &self.api_key)
            .header("x-rapidapi-host", &self.host)
            .query(&params)
    }

    fn parse_page(&self, body: Value) -> Result<ParsedPage, FetchError> {
        let hits = body
            .get("hits")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::Malformed("response has no hits array".to_string()))?;

        Ok(collect_page(hits, |hit| self.map_hit(hit), UAE_REAL_ESTATE))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Apify scraper dataset
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs an Apify scraper actor synchronously and reads its dataset items.
pub struct ApifyDatasetSource {
    base_url: String,
    token: String,
    actor: String,
}

impl ApifyDatasetSource {
    pub fn new(base_url: &str, token: &str, actor: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            actor: actor.to_string(),
        }
    }

    fn map_item(&self, item: &Value) -> Option<RawListing> {
        let external_id = ["id", "propertyId"]
            .iter()
            .find_map(|key| item.get(key).and_then(value_to_string))?;

        Some(RawListing {
            source: APIFY_DATASET.to_string(),
            external_id,
            title: string_field(item, &["title", "name"]),
            location: string_field(item, &["location", "address"]),
            property_type: string_field(item, &["propertyType"]).to_lowercase(),
            listing_type: purpose_label(&string_field(item, &["purpose"])),
            price: item.get("price").and_then(value_to_f64),
            bedrooms: ["bedrooms", "rooms"]
                .iter()
                .find_map(|key| item.get(key).and_then(value_to_u32)),
            bathrooms: ["bathrooms", "baths"]
                .iter()
                .find_map(|key| item.get(key).and_then(value_to_u32)),
            size_sqft: ["area", "size"]
                .iter()
                .find_map(|key| item.get(key).and_then(value_to_f64)),
            url: ["url", "link"]
                .iter()
                .find_map(|key| item.get(key).and_then(Value::as_str))
                .map(str::to_string),
        })
    }
}

impl ListingSource for ApifyDatasetSource {
    fn id(&self) -> &str {
        APIFY_DATASET
    }

    fn build_request(&self, http: &Client, query: &ListingQuery, _page: u32) -> RequestBuilder {
        let input = serde_json::json!({
            "location": query.area_filter,
            "propertyType": "all",
            "purpose": query.purpose.as_deref().unwrap_or("all"),
            "maxItems": query.page_size,
        });

        http.post(format!(
            "{}/acts/{}/run-sync-get-dataset-items",
            self.base_url, self.actor
        ))
        .query(&[("token", self.token.as_str()), ("format", "json")])
        .json(&input)
    }

    fn parse_page(&self, body: Value) -> Result<ParsedPage, FetchError> {
        let items = body.as_array().ok_or_else(|| {
            FetchError::Malformed("dataset response is not an array".to_string())
        })?;

        Ok(collect_page(items, |item| self.map_item(item), APIFY_DATASET))
    }

    // Each request re-runs the actor; one run already returns up to `page_size` items.
    fn max_pages(&self, _query: &ListingQuery) -> u32 {
        1
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Field helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn collect_page<F>(records: &[Value], map: F, source: &str) -> ParsedPage
where
    F: Fn(&Value) -> Option<RawListing>,
{
    let listings: Vec<RawListing> = records.iter().filter_map(map).collect();

    let dropped = records.len() - listings.len();
    if dropped > 0 {
        tracing::warn!(
            "⚠️  {}: dropped {} records without a listing reference",
            source,
            dropped
        );
    }

    ParsedPage {
        listings,
        raw_count: records.len(),
    }
}

fn string_field(record: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| record.get(key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn purpose_label(purpose: &str) -> String {
    purpose
        .trim()
        .to_lowercase()
        .trim_start_matches("for-")
        .to_string()
}

fn value_to_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price_text(s),
        _ => None,
    }
}

fn value_to_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok(),
        _ => None,
    }
}
