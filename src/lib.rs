//! Polls real-estate listing APIs for one area, detects new listings, price
//! changes and delistings, and keeps a durable SQLite record of what it saw.

pub mod api;
pub mod core;
pub mod monitoring;
