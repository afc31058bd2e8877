//! SQLite destination.
//!
//! Tables are created on first write with column types inferred from the
//! first non-null value seen, and widened with `ALTER TABLE ADD COLUMN` when a
//! later batch carries new fields. Nested arrays and objects are stored as
//! JSON text.

use anyhow::{Context, Result, anyhow};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Transaction, params_from_iter};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{Row, Sink, WriteDisposition, validate_table};

/// SQLite sink.
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    /// Opens (or creates) a file-based database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of rows in `table`, or 0 if it does not exist.
    pub fn count(&self, table: &str) -> Result<usize> {
        validate_table(table)?;
        let conn = self.lock()?;
        if table_columns(&conn, table)?.is_empty() {
            return Ok(0);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |r| {
                r.get(0)
            })?;
        Ok(count as usize)
    }

    /// Reads every row of `table` in insertion order.
    pub fn read_table(&self, table: &str) -> Result<Vec<Row>> {
        validate_table(table)?;
        let conn = self.lock()?;
        read_rows(&conn, table)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }
}

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Maps a JSON value onto the closest SQLite storage class.
pub(crate) fn to_sql(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        Some(nested) => SqlValue::Text(nested.to_string()),
    }
}

pub(crate) fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::from(b),
    }
}

fn column_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "INTEGER",
        Value::Number(n) if n.is_i64() || n.is_u64() => "INTEGER",
        Value::Number(_) => "REAL",
        _ => "TEXT",
    }
}

/// Value of `column` in `row`. SQLite identifiers are case-insensitive, so
/// a key differing only in case maps onto the same column.
fn lookup<'a>(row: &'a Row, column: &str) -> Option<&'a Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    })
}

/// Existing columns followed by every new row key, deduplicated without
/// regard to ASCII case.
fn sqlite_columns(existing: Vec<String>, rows: &[Row]) -> Vec<String> {
    let mut columns = existing;
    for name in rows.iter().flat_map(|r| r.keys()) {
        if !columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            columns.push(name.clone());
        }
    }
    columns
}

fn infer_type(column: &str, rows: &[Row]) -> &'static str {
    rows.iter()
        .filter_map(|r| lookup(r, column))
        .find(|v| !v.is_null())
        .map(column_type)
        .unwrap_or("TEXT")
}

/// Existing column names of `table`, empty when the table does not exist.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

pub(crate) fn read_rows(conn: &Connection, table: &str) -> Result<Vec<Row>> {
    if table_columns(conn, table)?.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", quote(table)))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt
        .query_map([], |r| {
            let mut row = Row::new();
            for (idx, name) in names.iter().enumerate() {
                row.insert(name.clone(), from_sql(r.get::<_, SqlValue>(idx)?));
            }
            Ok(row)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Creates `table` or adds the columns it is missing. Returns the full
/// column list after the change.
fn ensure_table(tx: &Transaction<'_>, table: &str, rows: &[Row]) -> Result<Vec<String>> {
    let existing = table_columns(tx, table)?;
    let known = existing.len();
    let columns = sqlite_columns(existing, rows);

    if known == 0 {
        let defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", quote(c), infer_type(c, rows)))
            .collect();
        tx.execute(
            &format!("CREATE TABLE {} ({})", quote(table), defs.join(", ")),
            [],
        )?;
        debug!(table, columns = columns.len(), "Created table");
    } else {
        for column in columns.iter().skip(known) {
            tx.execute(
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote(table),
                    quote(column),
                    infer_type(column, rows)
                ),
                [],
            )?;
            debug!(table, column = %column, "Added column");
        }
    }

    Ok(columns)
}

fn insert_rows(
    tx: &Transaction<'_>,
    table: &str,
    columns: &[String],
    rows: &[Row],
    primary_key: Option<&str>,
) -> Result<()> {
    let column_list: Vec<String> = columns.iter().map(|c| quote(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(table),
        column_list.join(", "),
        placeholders.join(", ")
    );

    if let Some(pk) = primary_key {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !c.eq_ignore_ascii_case(pk))
            .map(|c| format!("{0} = excluded.{0}", quote(c)))
            .collect();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT({}) DO NOTHING", quote(pk)));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT({}) DO UPDATE SET {}",
                quote(pk),
                updates.join(", ")
            ));
        }
    }

    let mut stmt = tx.prepare(&sql)?;
    for row in rows {
        stmt.execute(params_from_iter(columns.iter().map(|c| to_sql(lookup(row, c)))))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Sink for SqliteSink {
    async fn write(
        &self,
        table: &str,
        rows: &[Row],
        disposition: &WriteDisposition,
    ) -> Result<usize> {
        validate_table(table)?;
        if rows.is_empty() && *disposition != WriteDisposition::Replace {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        match disposition {
            WriteDisposition::Replace => {
                tx.execute(&format!("DROP TABLE IF EXISTS {}", quote(table)), [])?;
                if !rows.is_empty() {
                    let columns = ensure_table(&tx, table, rows)?;
                    insert_rows(&tx, table, &columns, rows, None)?;
                }
            }
            WriteDisposition::Append => {
                let columns = ensure_table(&tx, table, rows)?;
                insert_rows(&tx, table, &columns, rows, None)?;
            }
            WriteDisposition::Merge { primary_key } => {
                if let Some(missing) = rows.iter().position(|r| {
                    lookup(r, primary_key).is_none_or(Value::is_null)
                }) {
                    return Err(anyhow!(
                        "row {missing} is missing primary key column '{primary_key}'"
                    ));
                }
                let columns = ensure_table(&tx, table, rows)?;
                tx.execute(
                    &format!(
                        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                        quote(&format!("{table}__{primary_key}__pk")),
                        quote(table),
                        quote(primary_key)
                    ),
                    [],
                )
                .with_context(|| {
                    format!("table '{table}' holds duplicate values for '{primary_key}'")
                })?;
                insert_rows(&tx, table, &columns, rows, Some(primary_key))?;
            }
        }

        tx.commit()?;
        debug!(table, rows = rows.len(), %disposition, "SQLite write committed");
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
    async fn test_append_creates_table_and_inserts() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let rows = vec![
            row(json!({"station_id": "1", "no_mechanical": 3, "no_ebike": 1})),
            row(json!({"station_id": "2", "no_mechanical": 0, "no_ebike": 5})),
        ];

        let written = sink
            .write("station_data", &rows, &WriteDisposition::Append)
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(sink.count("station_data").unwrap(), 2);

        let back = sink.read_table("station_data").unwrap();
        assert_eq!(back[0]["no_mechanical"], json!(3));
        assert_eq!(back[1]["station_id"], json!("2"));
    }

    #[tokio::test]
    async fn test_append_twice_keeps_duplicates() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let rows = vec![row(json!({"station_id": "1"}))];

        sink.write("t", &rows, &WriteDisposition::Append).await.unwrap();
        sink.write("t", &rows, &WriteDisposition::Append).await.unwrap();

        assert_eq!(sink.count("t").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_columns_are_added() {
        let sink = SqliteSink::open_in_memory().unwrap();

        sink.write(
            "t",
            &[row(json!({"station_id": "1"}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();
        sink.write(
            "t",
            &[row(json!({"station_id": "2", "is_renting": true}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let back = sink.read_table("t").unwrap();
        assert_eq!(back[0]["is_renting"], Value::Null);
        assert_eq!(back[1]["is_renting"], json!(1));
    }

    #[tokio::test]
    async fn test_column_differing_only_in_case_reuses_existing() {
        let sink = SqliteSink::open_in_memory().unwrap();

        sink.write(
            "info",
            &[row(json!({"station_id": "1", "name": "Godard"}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();
        sink.write(
            "info",
            &[row(json!({"station_id": "2", "Name": "Mazet"}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();
        sink.write(
            "info",
            &[row(json!({"station_id": "3", "name": "Clauzel"}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let back = sink.read_table("info").unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0].len(), 2);
        assert_eq!(back[1]["name"], json!("Mazet"));
    }

    #[tokio::test]
    async fn test_first_batch_with_case_variants_creates_one_column() {
        let sink = SqliteSink::open_in_memory().unwrap();

        sink.write(
            "t",
            &[row(json!({"ID": "1"})), row(json!({"id": "2"}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let back = sink.read_table("t").unwrap();
        assert_eq!(back[0]["ID"], json!("1"));
        assert_eq!(back[1]["ID"], json!("2"));
    }

    #[tokio::test]
    async fn test_merge_upserts() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let merge = WriteDisposition::Merge {
            primary_key: "station_id".into(),
        };

        sink.write(
            "info",
            &[
                row(json!({"station_id": "1", "capacity": 10})),
                row(json!({"station_id": "2", "capacity": 20})),
            ],
            &merge,
        )
        .await
        .unwrap();
        sink.write(
            "info",
            &[
                row(json!({"station_id": "2", "capacity": 22})),
                row(json!({"station_id": "3", "capacity": 30})),
            ],
            &merge,
        )
        .await
        .unwrap();

        let back = sink.read_table("info").unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[1]["capacity"], json!(22));
    }

    #[tokio::test]
    async fn test_merge_rejects_rows_without_key() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let merge = WriteDisposition::Merge {
            primary_key: "station_id".into(),
        };

        let result = sink.write("info", &[row(json!({"capacity": 1}))], &merge).await;

        assert!(result.is_err());
        assert_eq!(sink.count("info").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let sink = SqliteSink::open_in_memory().unwrap();
        let rows = vec![row(json!({"a": 1})), row(json!({"a": 2}))];

        sink.write("t", &rows, &WriteDisposition::Replace).await.unwrap();
        sink.write("t", &rows, &WriteDisposition::Replace).await.unwrap();

        assert_eq!(sink.count("t").unwrap(), 2);

        sink.write("t", &[], &WriteDisposition::Replace).await.unwrap();
        assert_eq!(sink.count("t").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nested_values_stored_as_json_text() {
        let sink = SqliteSink::open_in_memory().unwrap();

        sink.write(
            "t",
            &[row(json!({"id": "1", "rental_uris": {"ios": "x"}}))],
            &WriteDisposition::Append,
        )
        .await
        .unwrap();

        let back = sink.read_table("t").unwrap();
        assert_eq!(back[0]["rental_uris"], json!(r#"{"ios":"x"}"#));
    }

    #[test]
    fn test_quote_escapes_double_quotes() {
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }
}
