use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

use super::FeedSource;
use crate::fetch::{BasicClient, HttpClient, load_source};
use crate::parser::{FeedSnapshot, parse_snapshot};

const PREFERRED_LANGUAGE: &str = "en";

/// Client for one GBFS system, built from its auto-discovery document.
pub struct GbfsClient<C = BasicClient> {
    http: C,
    feeds: HashMap<String, String>,
}

impl<C: HttpClient> GbfsClient<C> {
    /// Fetches the discovery document (`gbfs.json`) at `discovery_url` and
    /// indexes the feeds it advertises.
    #[tracing::instrument(skip(http))]
    pub async fn connect(http: C, discovery_url: &str) -> Result<Self> {
        let bytes = load_source(&http, discovery_url)
            .await
            .context("failed to load GBFS discovery document")?;
        let doc: Value =
            serde_json::from_slice(&bytes).context("GBFS discovery document is not JSON")?;
        let feeds = parse_discovery(&doc)?;

        info!(feeds = feeds.len(), "GBFS discovery loaded");
        Ok(Self::with_feeds(http, feeds))
    }

    pub fn with_feeds(http: C, feeds: HashMap<String, String>) -> Self {
        Self { http, feeds }
    }

    pub fn feed_url(&self, feed: &str) -> Option<&str> {
        self.feeds.get(feed).map(String::as_str)
    }

    pub fn feed_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.feeds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait::async_trait]
impl<C: HttpClient> FeedSource for GbfsClient<C> {
    async fn fetch(&self, feed: &str) -> Result<FeedSnapshot> {
        let url = self
            .feed_url(feed)
            .ok_or_else(|| anyhow!("system does not publish feed '{feed}'"))?;

        let bytes = load_source(&self.http, url).await?;
        let snapshot =
            parse_snapshot(&bytes).with_context(|| format!("malformed '{feed}' document"))?;

        debug!(
            feed,
            stations = snapshot.stations().map(Vec::len),
            ttl = snapshot.ttl_secs(),
            version = ?snapshot.version_str(),
            "Feed snapshot fetched"
        );
        Ok(snapshot)
    }
}

/// Extracts `feed name -> url` from a discovery document.
///
/// GBFS 2.x nests the feed list under a language code (English preferred,
/// otherwise the first language listed); GBFS 3.x puts it straight under
/// `data.feeds`.
pub fn parse_discovery(doc: &Value) -> Result<HashMap<String, String>> {
    let data = doc
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("discovery document has no 'data' object"))?;

    let feeds = match data.get("feeds") {
        Some(feeds) => feeds,
        None => data
            .get(PREFERRED_LANGUAGE)
            .or_else(|| data.values().next())
            .and_then(|lang| lang.get("feeds"))
            .ok_or_else(|| anyhow!("discovery document lists no feeds"))?,
    };

    let feeds = feeds
        .as_array()
        .ok_or_else(|| anyhow!("discovery 'feeds' is not a list"))?
        .iter()
        .filter_map(|f| {
            let name = f.get("name")?.as_str()?;
            let url = f.get("url")?.as_str()?;
            Some((name.to_string(), url.to_string()))
        })
        .collect();

    Ok(feeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_parse_v2_prefers_english() {
        let doc = json!({
            "data": {
                "fr": {"feeds": [{"name": "station_status", "url": "https://x/fr/status"}]},
                "en": {"feeds": [{"name": "station_status", "url": "https://x/en/status"}]}
            }
        });

        let feeds = parse_discovery(&doc).unwrap();

        assert_eq!(feeds["station_status"], "https://x/en/status");
    }

    #[test]
    fn test_parse_v2_falls_back_to_first_language() {
        let doc = json!({
            "data": {"fr": {"feeds": [
                {"name": "station_information", "url": "https://x/info"},
                {"name": "station_status", "url": "https://x/status"}
            ]}}
        });

        let feeds = parse_discovery(&doc).unwrap();

        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds["station_information"], "https://x/info");
    }

    #[test]
    fn test_parse_v3_flat_feeds() {
        let doc = json!({
            "version": "3.0",
            "data": {"feeds": [{"name": "station_status", "url": "https://x/status"}]}
        });

        let feeds = parse_discovery(&doc).unwrap();

        assert_eq!(feeds["station_status"], "https://x/status");
    }

    #[test]
    fn test_parse_without_data_is_error() {
        assert!(parse_discovery(&json!({"ttl": 0})).is_err());
        assert!(parse_discovery(&json!({"data": {}})).is_err());
    }

    #[test]
    fn test_parse_skips_incomplete_entries() {
        let doc = json!({
            "data": {"feeds": [{"name": "station_status"}, {"name": "system_information", "url": "u"}]}
        });

        let feeds = parse_discovery(&doc).unwrap();

        assert_eq!(feeds.len(), 1);
        assert!(feeds.contains_key("system_information"));
    }

    #[tokio::test]
    async fn test_connect_and_fetch_from_local_documents() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join("station_status.json");
        fs::write(
            &status_path,
            r#"{"last_updated": 1, "ttl": 0, "data": {"stations": [{"station_id": "1"}]}}"#,
        )
        .unwrap();

        let discovery_path = dir.path().join("gbfs.json");
        let discovery = json!({
            "data": {"en": {"feeds": [
                {"name": "station_status", "url": status_path.to_str().unwrap()}
            ]}}
        });
        fs::write(&discovery_path, discovery.to_string()).unwrap();

        let client = GbfsClient::connect(
            BasicClient::new().unwrap(),
            discovery_path.to_str().unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(client.feed_names(), vec!["station_status"]);

        let snapshot = client.fetch("station_status").await.unwrap();
        assert_eq!(snapshot.stations().unwrap().len(), 1);

        assert!(client.fetch("station_information").await.is_err());
    }
}
