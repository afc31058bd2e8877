//! One-shot table copy from a local SQLite database into any [`Sink`].
//!
//! The source schema is discovered from a single-row sample, then rows are
//! read in `chunk_size` pages keyed on `rowid` (each page starts after the
//! last rowid of the previous one) and handed to the sink page by page, so
//! memory stays bounded by one page and every page is an index seek.

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use tracing::{debug, info};

use crate::sink::sqlite::{from_sql, quote};
use crate::sink::{Row, Sink, WriteDisposition, validate_table};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_TABLE_NAME: &str = "default_table";
pub const DEFAULT_DATASET: &str = "default";

/// Read-only handle on a source SQLite table.
pub struct SqliteSource {
    conn: Connection,
    table: String,
    columns: Vec<String>,
}

impl SqliteSource {
    /// Opens `path` read-only and reads `table`'s column names.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        Self::from_connection(conn, table)
    }

    pub fn from_connection(conn: Connection, table: &str) -> Result<Self> {
        validate_table(table)?;
        let columns = {
            let stmt = conn
                .prepare(&format!("SELECT * FROM {} LIMIT 1", quote(table)))
                .with_context(|| format!("source table '{table}' is not readable"))?;
            stmt.column_names()
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        };
        debug!(table, columns = ?columns, "Discovered source schema");

        Ok(Self {
            conn,
            table: table.to_string(),
            columns,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Reads up to `limit` rows whose `rowid` is greater than `after`, in
    /// `rowid` order. Pass `None` for the first page.
    pub fn fetch_chunk(&self, after: Option<i64>, limit: usize) -> Result<Chunk> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT rowid, * FROM {} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            quote(&self.table)
        ))?;

        let mut last_rowid = None;
        let rows = stmt
            .query_map([after.unwrap_or(i64::MIN), limit as i64], |r| {
                let rowid: i64 = r.get(0)?;
                let mut row = Row::new();
                for (idx, name) in self.columns.iter().enumerate() {
                    row.insert(name.clone(), from_sql(r.get::<_, SqlValue>(idx + 1)?));
                }
                Ok((rowid, row))
            })?
            .map(|res| {
                res.map(|(rowid, row)| {
                    last_rowid = Some(rowid);
                    row
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Chunk { rows, last_rowid })
    }
}

/// One page of source rows and the rowid to resume after.
#[derive(Debug)]
pub struct Chunk {
    pub rows: Vec<Row>,
    pub last_rowid: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateOptions {
    pub destination_table: String,
    pub chunk_size: usize,
    pub disposition: WriteDisposition,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            destination_table: DEFAULT_TABLE_NAME.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            disposition: WriteDisposition::Replace,
        }
    }
}

/// Copies every source row into the destination table and returns the
/// number of rows written.
///
/// Under `replace` the first page replaces the destination and later pages
/// append to it, so the destination ends up holding exactly the source rows.
/// An empty source under `replace` empties the destination.
#[tracing::instrument(skip_all, fields(source = %source.table, destination = %options.destination_table, chunk_size = options.chunk_size))]
pub async fn replicate(
    source: &SqliteSource,
    sink: &dyn Sink,
    options: &ReplicateOptions,
) -> Result<usize> {
    if options.chunk_size == 0 {
        bail!("chunk size must be at least 1");
    }

    let mut after = None;
    let mut read = 0;
    let mut written = 0;
    let mut chunks = 0;

    loop {
        let Chunk { rows: chunk, last_rowid } = source.fetch_chunk(after, options.chunk_size)?;
        let first = chunks == 0;

        if chunk.is_empty() {
            if first && options.disposition == WriteDisposition::Replace {
                sink.write(&options.destination_table, &[], &WriteDisposition::Replace)
                    .await?;
            }
            break;
        }

        let disposition = match (&options.disposition, first) {
            (WriteDisposition::Replace, false) => WriteDisposition::Append,
            (other, _) => other.clone(),
        };

        written += sink
            .write(&options.destination_table, &chunk, &disposition)
            .await
            .with_context(|| format!("failed writing chunk starting at row {read}"))?;
        chunks += 1;
        read += chunk.len();
        after = last_rowid;
        debug!(chunk = chunks, rows = chunk.len(), "Chunk written");

        if chunk.len() < options.chunk_size {
            break;
        }
    }

    info!(rows = written, chunks, disposition = %options.disposition, "Replication complete");
    Ok(written)
}
