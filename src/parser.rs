//! JSON parser for GBFS feed documents.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

/// One fetched, point-in-time GBFS document.
///
/// The header fields are kept loosely typed: GBFS 2.x publishes
/// `last_updated` as POSIX seconds while 3.x uses an RFC 3339 string, and
/// publishers disagree on whether `version` and `ttl` are strings or
/// numbers. A header never fails the parse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedSnapshot {
    #[serde(default)]
    pub last_updated: Option<Value>,
    #[serde(default)]
    pub ttl: Option<Value>,
    #[serde(default)]
    pub version: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl FeedSnapshot {
    /// Station entries under `data.stations`, or `None` when the snapshot
    /// has no such list.
    pub fn stations(&self) -> Option<&Vec<Value>> {
        self.data.as_ref()?.get("stations")?.as_array()
    }

    /// `ttl` in whole seconds, when it is a non-negative number or a
    /// numeric string.
    pub fn ttl_secs(&self) -> Option<u64> {
        match self.ttl.as_ref()? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `version` rendered as text (`2.3` and `"2.3"` both give `"2.3"`).
    pub fn version_str(&self) -> Option<String> {
        match self.version.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Builds a snapshot around a bare station list.
    pub fn from_stations(stations: Vec<Value>) -> Self {
        Self {
            data: Some(serde_json::json!({ "stations": stations })),
            ..Default::default()
        }
    }
}

/// Decodes a GBFS JSON document from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not a JSON object.
pub fn parse_snapshot(bytes: &[u8]) -> Result<FeedSnapshot> {
    let value: Value = serde_json::from_slice(bytes).context("feed document is not valid JSON")?;
    if !value.is_object() {
        bail!("feed document is not a JSON object");
    }
    serde_json::from_value(value).context("feed document has a malformed header")
}
