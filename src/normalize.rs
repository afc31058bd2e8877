//! Snapshot normalization: raw GBFS station entries to flat, sink-ready rows.
//!
//! Pure functions, no I/O. Malformed records are dropped and logged; a
//! snapshot without a station list yields no rows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::gbfs::{STATION_INFORMATION, STATION_STATUS};
use crate::parser::FeedSnapshot;
use crate::sink::Row;

pub const AVAILABILITY_FIELD: &str = "num_bikes_available_types";
pub const MECHANICAL: &str = "mechanical";
pub const EBIKE: &str = "ebike";

/// Columns added by normalization; feed attributes with the same names are
/// discarded so they cannot shadow them.
const DERIVED_COLUMNS: [&str; 4] = ["station_id", "no_mechanical", "no_ebike", "time"];

/// A station status record flattened for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub station_id: String,
    /// Remaining feed attributes in feed order, availability mapping removed.
    pub attributes: Map<String, Value>,
    pub no_mechanical: i64,
    pub no_ebike: i64,
    pub time: DateTime<Utc>,
}

impl NormalizedRow {
    /// Column order: `station_id`, feed attributes, `no_mechanical`,
    /// `no_ebike`, `time`.
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("station_id".into(), Value::String(self.station_id));
        row.extend(self.attributes);
        row.insert("no_mechanical".into(), Value::from(self.no_mechanical));
        row.insert("no_ebike".into(), Value::from(self.no_ebike));
        row.insert("time".into(), Value::String(format_time(self.time)));
        row
    }
}

/// Which feed a resource reads and how its records are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    StationInformation,
    StationStatus,
}

impl FeedKind {
    pub fn feed_name(self) -> &'static str {
        match self {
            Self::StationInformation => STATION_INFORMATION,
            Self::StationStatus => STATION_STATUS,
        }
    }

    pub fn normalize(self, snapshot: &FeedSnapshot, time: DateTime<Utc>) -> Vec<Row> {
        match self {
            Self::StationInformation => normalize_information(snapshot, time),
            Self::StationStatus => normalize_status(snapshot, time)
                .into_iter()
                .map(NormalizedRow::into_row)
                .collect(),
        }
    }
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn station_id(record: &Map<String, Value>) -> Option<String> {
    match record.get("station_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flattens an availability value into `(vehicle type, count)` pairs in
/// feed order. Accepts an object (`{"mechanical": 3, "ebike": 1}`) or a
/// list of single-key objects (`[{"mechanical": 3}, {"ebike": 1}]`).
fn availability_entries(value: &Value) -> Option<Vec<(&str, &Value)>> {
    match value {
        Value::Object(map) => Some(map.iter().map(|(k, v)| (k.as_str(), v)).collect()),
        Value::Array(items) => {
            let mut entries = Vec::new();
            for item in items {
                let map = item.as_object()?;
                entries.extend(map.iter().map(|(k, v)| (k.as_str(), v)));
            }
            Some(entries)
        }
        _ => None,
    }
}

enum Availability {
    Counts { mechanical: i64, ebike: i64 },
    TooFew(usize),
    Unrecognized(Vec<String>),
    Malformed,
}

fn classify(value: Option<&Value>) -> Availability {
    let Some(value) = value else {
        return Availability::Malformed;
    };
    let Some(entries) = availability_entries(value) else {
        return Availability::Malformed;
    };
    if entries.len() < 2 {
        return Availability::TooFew(entries.len());
    }

    let lookup = |name: &str| entries.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);
    match (lookup(MECHANICAL), lookup(EBIKE)) {
        (Some(mechanical), Some(ebike)) => match (mechanical.as_i64(), ebike.as_i64()) {
            (Some(mechanical), Some(ebike)) => Availability::Counts { mechanical, ebike },
            _ => Availability::Malformed,
        },
        _ => Availability::Unrecognized(entries.iter().map(|(k, _)| k.to_string()).collect()),
    }
}

/// Normalizes a `station_status` snapshot.
///
/// Each record's availability-by-type mapping is replaced by the
/// `no_mechanical` and `no_ebike` columns, looked up by vehicle type name,
/// and every row is stamped with the same `time`. Output keeps station order
/// and holds at most one row per record.
pub fn normalize_status(snapshot: &FeedSnapshot, time: DateTime<Utc>) -> Vec<NormalizedRow> {
    let Some(stations) = snapshot.stations() else {
        warn!("Snapshot has no data.stations list, nothing to normalize");
        return Vec::new();
    };

    let mut rows = Vec::with_capacity(stations.len());
    for (idx, station) in stations.iter().enumerate() {
        let Some(record) = station.as_object() else {
            warn!(index = idx, "Station entry is not an object, dropped");
            continue;
        };
        let Some(station_id) = station_id(record) else {
            warn!(index = idx, "Station entry has no usable station_id, dropped");
            continue;
        };

        let (no_mechanical, no_ebike) = match classify(record.get(AVAILABILITY_FIELD)) {
            Availability::Counts { mechanical, ebike } => (mechanical, ebike),
            Availability::TooFew(n) => {
                debug!(station_id = %station_id, entries = n, "Too few availability entries, dropped");
                continue;
            }
            Availability::Unrecognized(keys) => {
                warn!(
                    station_id = %station_id,
                    keys = ?keys,
                    "Unrecognized vehicle types in availability, dropped"
                );
                continue;
            }
            Availability::Malformed => {
                warn!(station_id = %station_id, "Malformed availability mapping, dropped");
                continue;
            }
        };

        let attributes = record
            .iter()
            .filter(|(k, _)| k.as_str() != AVAILABILITY_FIELD && !DERIVED_COLUMNS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        rows.push(NormalizedRow {
            station_id,
            attributes,
            no_mechanical,
            no_ebike,
            time,
        });
    }

    debug!(
        stations = stations.len(),
        rows = rows.len(),
        "Normalized station status"
    );
    rows
}

/// Normalizes a `station_information` snapshot: records are kept whole,
/// `station_id` is rendered as a string and `updated_at` is stamped on
/// every row.
pub fn normalize_information(snapshot: &FeedSnapshot, time: DateTime<Utc>) -> Vec<Row> {
    let Some(stations) = snapshot.stations() else {
        warn!("Snapshot has no data.stations list, nothing to normalize");
        return Vec::new();
    };

    let updated_at = Value::String(format_time(time));
    let mut rows = Vec::with_capacity(stations.len());

    for (idx, station) in stations.iter().enumerate() {
        let Some(record) = station.as_object() else {
            warn!(index = idx, "Station entry is not an object, dropped");
            continue;
        };
        let Some(station_id) = station_id(record) else {
            warn!(index = idx, "Station entry has no usable station_id, dropped");
            continue;
        };

        let mut row = Row::new();
        row.insert("station_id".into(), Value::String(station_id));
        for (k, v) in record {
            if k != "station_id" && k != "updated_at" {
                row.insert(k.clone(), v.clone());
            }
        }
        row.insert("updated_at".into(), updated_at.clone());
        rows.push(row);
    }

    rows
}
