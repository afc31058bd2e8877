//! Destinations for normalized rows.
//!
//! [`Sink`] is the async trait every destination implements. Three
//! destinations ship with the crate:
//! - [`SqliteSink`] -- local SQLite database, one table per resource
//! - [`CsvSink`] -- local directory, one CSV file per table
//! - [`S3Sink`] -- gzip JSON-lines objects on S3, queried through Athena

mod filesystem;
mod s3;
pub(crate) mod sqlite;

pub use filesystem::CsvSink;
pub use s3::{ObjectStore, S3Sink, S3Store};
pub use sqlite::SqliteSink;

use crate::config::{Credentials, Settings};
use anyhow::{Result, anyhow, bail};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One sink-ready record: column name to JSON value, in insertion order.
pub type Row = Map<String, Value>;

/// Persistence strategy for a batch of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteDisposition {
    /// Insert-only; duplicates are possible.
    Append,
    /// Upsert keyed on `primary_key`.
    Merge { primary_key: String },
    /// Drop whatever the table holds and write the batch.
    Replace,
}

impl WriteDisposition {
    /// Builds a disposition from its CLI name. `merge` requires a key.
    pub fn parse(kind: &str, primary_key: Option<&str>) -> Result<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            "merge" => {
                let primary_key = primary_key
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| anyhow!("merge disposition requires a primary key"))?;
                Ok(Self::Merge {
                    primary_key: primary_key.to_string(),
                })
            }
            other => bail!("unknown write disposition '{other}' (expected append, merge or replace)"),
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Append => f.write_str("append"),
            Self::Merge { primary_key } => write!(f, "merge({primary_key})"),
            Self::Replace => f.write_str("replace"),
        }
    }
}

/// A destination that persists rows under a table name.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Writes `rows` to `table` and returns the number of rows written.
    ///
    /// An empty batch is valid: append and merge do nothing, replace leaves
    /// the table empty.
    async fn write(&self, table: &str, rows: &[Row], disposition: &WriteDisposition)
    -> Result<usize>;
}

/// Table names end up in file paths, object keys and SQL identifiers, so
/// they are limited to ASCII letters, digits, `_` and `-`.
pub(crate) fn validate_table(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        bail!("invalid table name '{table}'");
    }
    Ok(())
}

/// Renders a primary-key value as a comparable string.
pub(crate) fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Upserts `incoming` into `existing` by `primary_key`.
///
/// Existing rows keep their position; updated rows are replaced in place and
/// unseen keys are appended in arrival order. Rows of `existing` without a
/// key are kept untouched.
///
/// # Errors
///
/// Fails if an incoming row has no value for `primary_key`.
pub fn merge_rows(existing: Vec<Row>, incoming: &[Row], primary_key: &str) -> Result<Vec<Row>> {
    let mut merged = existing;
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (idx, row) in merged.iter().enumerate() {
        if let Some(key) = row.get(primary_key).and_then(key_string) {
            positions.insert(key, idx);
        }
    }

    for row in incoming {
        let key = row
            .get(primary_key)
            .and_then(key_string)
            .ok_or_else(|| anyhow!("row is missing primary key column '{primary_key}'"))?;

        match positions.get(&key) {
            Some(&idx) => merged[idx] = row.clone(),
            None => {
                positions.insert(key, merged.len());
                merged.push(row.clone());
            }
        }
    }

    Ok(merged)
}

/// Union of column names across `rows`, in first-seen order.
pub(crate) fn column_union<'a>(
    base: impl IntoIterator<Item = &'a str>,
    rows: &'a [Row],
) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for name in base.into_iter().chain(rows.iter().flat_map(|r| r.keys().map(String::as_str))) {
        if !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    }
    columns
}

/// Opens the destination named on the command line.
///
/// `athena` (alias `s3`) needs credentials; a missing credential source is
/// a startup error. Local destinations live under `settings.data_dir`.
pub async fn open_destination(
    destination: &str,
    dataset: &str,
    settings: &Settings,
) -> Result<Arc<dyn Sink>> {
    let dataset = dataset.to_lowercase();

    match destination.to_ascii_lowercase().as_str() {
        "athena" | "s3" => {
            let credentials = Credentials::load(&settings.credentials_file)?;
            let sink = S3Sink::connect(&credentials, settings, &dataset).await?;
            Ok(Arc::new(sink))
        }
        "sqlite" => {
            std::fs::create_dir_all(&settings.data_dir)?;
            let path = settings.data_dir.join(format!("{dataset}.db"));
            Ok(Arc::new(SqliteSink::open(&path)?))
        }
        "filesystem" | "csv" => {
            let dir = settings.data_dir.join(&dataset);
            Ok(Arc::new(CsvSink::new(dir)?))
        }
        other => bail!("unknown destination '{other}' (expected athena, sqlite or filesystem)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_dispositions() {
        assert_eq!(
            WriteDisposition::parse("append", None).unwrap(),
            WriteDisposition::Append
        );
        assert_eq!(
            WriteDisposition::parse("REPLACE", None).unwrap(),
            WriteDisposition::Replace
        );
        assert_eq!(
            WriteDisposition::parse("merge", Some("station_id")).unwrap(),
            WriteDisposition::Merge {
                primary_key: "station_id".into()
            }
        );
    }

    #[test]
    fn test_merge_requires_primary_key() {
        assert!(WriteDisposition::parse("merge", None).is_err());
        assert!(WriteDisposition::parse("merge", Some("")).is_err());
    }

    #[test]
    fn test_unknown_disposition() {
        assert!(WriteDisposition::parse("upsert", None).is_err());
    }

    #[test]
    fn test_merge_rows_updates_in_place_and_appends_new() {
        let existing = vec![
            row(json!({"station_id": "1", "capacity": 10})),
            row(json!({"station_id": "2", "capacity": 20})),
        ];
        let incoming = vec![
            row(json!({"station_id": "2", "capacity": 25})),
            row(json!({"station_id": "3", "capacity": 30})),
        ];

        let merged = merge_rows(existing, &incoming, "station_id").unwrap();

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["capacity"], json!(10));
        assert_eq!(merged[1]["capacity"], json!(25));
        assert_eq!(merged[2]["station_id"], json!("3"));
    }

    #[test]
    fn test_merge_rows_last_duplicate_wins() {
        let incoming = vec![
            row(json!({"station_id": "1", "capacity": 1})),
            row(json!({"station_id": "1", "capacity": 2})),
        ];

        let merged = merge_rows(Vec::new(), &incoming, "station_id").unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["capacity"], json!(2));
    }

    #[test]
    fn test_merge_rows_numeric_and_string_keys_match() {
        let existing = vec![row(json!({"station_id": "7", "name": "old"}))];
        let incoming = vec![row(json!({"station_id": 7, "name": "new"}))];

        let merged = merge_rows(existing, &incoming, "station_id").unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["name"], json!("new"));
    }

    #[test]
    fn test_merge_rows_rejects_missing_key() {
        let incoming = vec![row(json!({"name": "no key"}))];
        assert!(merge_rows(Vec::new(), &incoming, "station_id").is_err());
    }

    #[test]
    fn test_validate_table() {
        assert!(validate_table("station_data").is_ok());
        assert!(validate_table("default-table").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("../etc").is_err());
        assert!(validate_table("a b").is_err());
    }

    #[test]
    fn test_column_union_keeps_first_seen_order() {
        let rows = vec![
            row(json!({"a": 1, "b": 2})),
            row(json!({"b": 3, "c": 4})),
        ];
        let columns = column_union(["z", "a"], &rows);
        assert_eq!(columns, vec!["z", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_open_unknown_destination() {
        let settings = Settings {
            region: "eu-central-1".into(),
            s3_bucket: "bucket".into(),
            credentials_file: "missing.json".into(),
            data_dir: std::env::temp_dir(),
            systems_catalog: String::new(),
        };
        assert!(open_destination("bigquery", "paris", &settings).await.is_err());
    }
}
