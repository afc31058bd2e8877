//! GBFS feed access.
//!
//! [`SystemCatalog`] resolves a system name to its auto-discovery URL.
//! [`GbfsClient`] reads the discovery document and fetches named feeds.
//! [`FeedSource`] is the seam the ingestion loop polls through.

mod catalog;
mod client;

pub use catalog::{System, SystemCatalog};
pub use client::{GbfsClient, parse_discovery};

use crate::parser::FeedSnapshot;
use anyhow::Result;

pub const STATION_INFORMATION: &str = "station_information";
pub const STATION_STATUS: &str = "station_status";

/// Anything that can return the current snapshot of a named feed.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, feed: &str) -> Result<FeedSnapshot>;
}
