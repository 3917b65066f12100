pub mod client;
pub mod rate_limiter;
pub mod retry;
pub mod sources;
pub mod types;

pub use client::{FetchClient, FetchClientConfig, ListingFetcher};
#[cfg(test)]
pub use client::MockListingFetcher;
pub use rate_limiter::{RequestThrottle, ThrottleConfig};
pub use retry::{Backoff, RetryPolicy};
pub use sources::{ApifyDatasetSource, ListingSource, UaeRealEstateSource};
pub use types::*;
