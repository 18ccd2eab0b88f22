//! Wareline Sources - adapters feeding the core pipeline
//!
//! Each adapter implements [`wareline_core::Source`]. Network adapters block
//! on the shared tokio runtime in [`http`]; response parsing is kept in pure
//! functions so it can be tested without a network.

pub mod catalog;
pub mod dataset;
pub mod feed;
pub mod http;
pub mod stats;

pub use catalog::{CatalogConfig, CatalogSource};
pub use dataset::Dataset;
pub use feed::{FeedConfig, FeedSource};
pub use http::{http_client, SHARED_RUNTIME};
pub use stats::{StatsConfig, StatsSource};
