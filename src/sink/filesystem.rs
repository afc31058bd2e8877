//! Local filesystem destination: one CSV file per table.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use tracing::debug;

use super::{Row, Sink, WriteDisposition, column_union, merge_rows, validate_table};

/// Writes each table to `<dir>/<table>.csv`.
///
/// Appends go straight to the end of the file while the header already
/// covers every incoming column. A batch that introduces new columns, a
/// merge, or a replace rewrites the file with the widened header.
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.csv"))
    }

    /// Reads a table back. Cells come back as strings; empty cells as null.
    pub fn read_table(&self, table: &str) -> Result<Vec<Row>> {
        let (_, rows) = self.read_file(table)?;
        Ok(rows)
    }

    /// Header of an existing table file, without reading its rows.
    fn read_header(&self, table: &str) -> Result<Option<Vec<String>>> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok(None);
        }
        let mut rdr = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Some(rdr.headers()?.iter().map(str::to_string).collect()))
    }

    fn read_file(&self, table: &str) -> Result<(Vec<String>, Vec<Row>)> {
        let path = self.table_path(table);
        if !path.exists() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut rdr = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let header: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let row: Row = header
                .iter()
                .zip(record.iter())
                .map(|(name, cell)| {
                    let value = if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    };
                    (name.clone(), value)
                })
                .collect();
            rows.push(row);
        }

        Ok((header, rows))
    }

    fn rewrite(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<()> {
        let path = self.table_path(table);
        let file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

        writer.write_record(columns)?;
        for row in rows {
            writer.write_record(columns.iter().map(|c| cell(row.get(c))))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn append(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<()> {
        let path = self.table_path(table);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

        for row in rows {
            writer.write_record(columns.iter().map(|c| cell(row.get(c))))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[async_trait::async_trait]
impl Sink for CsvSink {
    async fn write(
        &self,
        table: &str,
        rows: &[Row],
        disposition: &WriteDisposition,
    ) -> Result<usize> {
        validate_table(table)?;
        let path = self.table_path(table);
        debug!(path = %path.display(), rows = rows.len(), %disposition, "Writing CSV table");

        match disposition {
            WriteDisposition::Replace => {
                if rows.is_empty() {
                    if path.exists() {
                        fs::remove_file(&path)?;
                    }
                    return Ok(0);
                }
                let columns = column_union([], rows);
                self.rewrite(table, &columns, rows)?;
            }
            WriteDisposition::Append => {
                if rows.is_empty() {
                    return Ok(0);
                }
                match self.read_header(table)? {
                    Some(header)
                        if column_union(header.iter().map(String::as_str), rows).len()
                            == header.len() =>
                    {
                        self.append(table, &header, rows)?;
                    }
                    _ => {
                        let (header, mut all) = self.read_file(table)?;
                        let columns = column_union(header.iter().map(String::as_str), rows);
                        all.extend_from_slice(rows);
                        self.rewrite(table, &columns, &all)?;
                    }
                }
            }
            WriteDisposition::Merge { primary_key } => {
                if rows.is_empty() {
                    return Ok(0);
                }
                let (header, existing) = self.read_file(table)?;
                let columns = column_union(header.iter().map(String::as_str), rows);
                let merged = merge_rows(existing, rows, primary_key)?;
                self.rewrite(table, &columns, &merged)?;
            }
        }

        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_append_creates_file_with_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let rows = vec![row(json!({"station_id": "1", "no_ebike": 2}))];

        sink.write("station_data", &rows, &WriteDisposition::Append)
            .await
            .unwrap();
        sink.write("station_data", &rows, &WriteDisposition::Append)
            .await
            .unwrap();

        let content = fs::read_to_string(sink.table_path("station_data")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "station_id,no_ebike");
    }

    #[tokio::test]
    async fn test_append_with_known_columns_reads_only_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        // A ragged body row makes any full parse of the file fail.
        fs::write(sink.table_path("t"), "station_id,no_ebike\n1,2,extra\n").unwrap();

        sink.write(
            "t",
            &[row(json!({"station_id": "3", "no_ebike": 4}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let content = fs::read_to_string(sink.table_path("t")).unwrap();
        assert!(content.ends_with("3,4\n"));
        assert!(sink.read_table("t").is_err());
    }

    #[tokio::test]
    async fn test_append_widens_header_for_new_columns() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();

        sink.write(
            "t",
            &[row(json!({"station_id": "1"}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();
        sink.write(
            "t",
            &[row(json!({"station_id": "2", "capacity": 9}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let rows = sink.read_table("t").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["capacity"], Value::Null);
        assert_eq!(rows[1]["capacity"], json!("9"));
    }

    #[tokio::test]
    async fn test_merge_upserts_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let merge = WriteDisposition::Merge {
            primary_key: "station_id".into(),
        };

        sink.write(
            "info",
            &[
                row(json!({"station_id": "1", "name": "A"})),
                row(json!({"station_id": "2", "name": "B"})),
            ],
            &merge,
        )
        .await
        .unwrap();
        sink.write("info", &[row(json!({"station_id": "2", "name": "B2"}))], &merge)
            .await
            .unwrap();

        let rows = sink.read_table("info").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], json!("B2"));
    }

    #[tokio::test]
    async fn test_replace_overwrites_and_empty_replace_clears() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();

        sink.write(
            "t",
            &[row(json!({"a": 1})), row(json!({"a": 2}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();
        sink.write("t", &[row(json!({"a": 3}))], &WriteDisposition::Replace)
            .await
            .unwrap();
        assert_eq!(sink.read_table("t").unwrap().len(), 1);

        sink.write("t", &[], &WriteDisposition::Replace).await.unwrap();
        assert!(sink.read_table("t").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_append_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();

        let written = sink.write("t", &[], &WriteDisposition::Append).await.unwrap();

        assert_eq!(written, 0);
        assert!(!sink.table_path("t").exists());
    }

    #[tokio::test]
    async fn test_nested_values_are_serialized_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();

        sink.write(
            "t",
            &[row(json!({"id": "1", "rental_methods": ["key", "creditcard"]}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let rows = sink.read_table("t").unwrap();
        assert_eq!(rows[0]["rental_methods"], json!(r#"["key","creditcard"]"#));
    }
}
