//! Text cleanup, validation and the content-hash identity of a listing.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::api::RawListing;

/// Prices above this are treated as data errors.
pub const MAX_REASONABLE_PRICE: f64 = 100_000_000.0;

const NOISE_PARTS: &[&str] = &["dubai", "uae", "united arab emirates"];
const TRAILING_WORDS: &[&str] = &["area", "district", "community"];
// Longest first so "industrial area 3" wins over "industrial 3"
const LOCATION_ALIASES: &[(&str, &str)] = &[
    ("ras al khor industrial area 3", "ras al khor industrial third"),
    ("industrial area 3", "industrial third"),
    ("industrial 3", "industrial third"),
    ("ras alkhor", "ras al khor"),
    ("rasalkhor", "ras al khor"),
    ("ind third", "industrial third"),
    ("ind 3", "industrial third"),
];

/// A validated listing with its stable id, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyCandidate {
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
}

/// Collapse whitespace and strip markup.
pub fn clean_text(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form of a location label for matching and hashing.
///
/// `"Dubai, Ras Al Khor Industrial Area 3"` and `"ras al khor ind 3"` both
/// become `"ras al khor industrial third"`.
pub fn normalize_location(location: &str) -> String {
    let lowered = clean_text(location).to_lowercase();

    lowered
        .split(',')
        .map(|part| {
            let mut part = format!(" {} ", part.split_whitespace().collect::<Vec<_>>().join(" "));
            for (alias, canonical) in LOCATION_ALIASES {
                part = part.replace(&format!(" {} ", alias), &format!(" {} ", canonical));
            }
            let mut part = part.trim().to_string();
            for word in TRAILING_WORDS {
                if let Some(rest) = part.strip_suffix(word) {
                    if rest.is_empty() || rest.ends_with(' ') {
                        part = rest.trim_end().to_string();
                    }
                }
            }
            part
        })
        .filter(|part| !part.is_empty() && !NOISE_PARTS.contains(&part.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Extract a number from free-form price text such as `"AED 85,000/yr"`.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // Both present: whichever comes last is the decimal separator
        (Some(comma), Some(dot)) if comma < dot => cleaned.replace(',', ""),
        (Some(_), Some(_)) => cleaned.replace('.', "").replace(',', "."),
        (Some(comma), None) => {
            if cleaned.len() - comma - 1 <= 2 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        // Several dots can only be thousands grouping
        (None, Some(dot)) if cleaned[..dot].contains('.') => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse().ok()
}

pub fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

pub fn prices_differ(a: f64, b: f64) -> bool {
    (round_price(a) - round_price(b)).abs() >= 0.005
}

/// Stable identity of a listing.
///
/// SHA-256 over a key-sorted JSON object of the normalized invariant fields,
/// so field order, whitespace, case and location aliases do not change it.
pub fn property_id(listing_ref: &str, location: &str, bedrooms: u32, size_sqft: Option<f64>) -> String {
    let canonical = json!({
        "bedrooms": bedrooms,
        "listing_ref": clean_text(listing_ref).to_lowercase(),
        "location": normalize_location(location),
        "size_sqft": size_sqft.map(|s| s.round() as i64).unwrap_or(0),
    });

    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

/// Problems that make a listing unusable. Empty means valid.
pub fn validate(listing: &RawListing) -> Vec<String> {
    let mut issues = Vec::new();

    if listing.external_id.trim().is_empty() {
        issues.push("missing listing reference".to_string());
    }
    if clean_text(&listing.location).is_empty() {
        issues.push("missing location".to_string());
    }
    match listing.price {
        None => issues.push("missing price".to_string()),
        Some(price) if !price.is_finite() || price <= 0.0 || price > MAX_REASONABLE_PRICE => {
            issues.push(format!("price outside reasonable range: {}", price))
        }
        Some(_) => {}
    }
    if let Some(size) = listing.size_sqft {
        if !size.is_finite() || size < 0.0 {
            issues.push(format!("invalid size: {}", size));
        }
    }

    issues
}

/// Trim and collapse the free-text fields of a listing.
pub fn clean_listing(listing: &RawListing) -> RawListing {
    RawListing {
        source: listing.source.trim().to_string(),
        external_id: clean_text(&listing.external_id),
        title: clean_text(&listing.title),
        location: clean_text(&listing.location),
        property_type: clean_text(&listing.property_type).to_lowercase(),
        listing_type: clean_text(&listing.listing_type).to_lowercase(),
        price: listing.price.map(round_price),
        bedrooms: listing.bedrooms,
        bathrooms: listing.bathrooms,
        size_sqft: listing.size_sqft,
        url: listing
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string),
    }
}

pub fn to_candidate(listing: &RawListing) -> Result<PropertyCandidate, Vec<String>> {
    let listing = clean_listing(listing);
    let issues = validate(&listing);
    if !issues.is_empty() {
        return Err(issues);
    }

    let bedrooms = listing.bedrooms.unwrap_or(0);
    Ok(PropertyCandidate {
        id: property_id(&listing.external_id, &listing.location, bedrooms, listing.size_sqft),
        price: listing.price.unwrap_or_default(),
        external_id: listing.external_id,
        source: listing.source,
        title: listing.title,
        location_label: listing.location,
        property_type: listing.property_type,
        listing_type: listing.listing_type,
        bedrooms,
        bathrooms: listing.bathrooms,
        size_sqft: listing.size_sqft,
        url: listing.url,
    })
}

/// Collapse duplicate ids: the later occurrence's data wins, the first
/// occurrence's position is kept so output order stays deterministic.
pub fn dedup_last_wins<T, F>(items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<T> = Vec::with_capacity(items.len());

    for item in items {
        let id = key(&item);
        match positions.get(&id) {
            Some(&index) => unique[index] = item,
            None => {
                positions.insert(id, unique.len());
                unique.push(item);
            }
        }
    }

    unique
}

/// Whether a location falls inside the monitored area. An empty target list
/// accepts everything.
pub fn matches_target(location: &str, targets: &[String]) -> bool {
    if targets.is_empty() {
        return true;
    }
    let location = normalize_location(location);
    targets
        .iter()
        .map(|target| normalize_location(target))
        .any(|target| !target.is_empty() && location.contains(&target))
}
